//! Connection establishment.
//!
//! A notifier's first `connect` call may be refused and still succeed later
//! through a background retry, so establishing a connection is a race
//! between three outcomes:
//! 1. The first attempt settles (success, transient refusal, or failure)
//! 2. The notifier emits `Connected`
//! 3. The notifier emits `Error`
//!
//! The first decisive outcome wins; the rest are dropped with the select.

use futures::future::try_join_all;
use tokio::sync::broadcast::error::RecvError;

use crate::error::{Error, Result};
use crate::transport::{Notifier, NotifierEvent};

/// Wait until `notifier` is connected, then listen to every channel in
/// `interest_set`.
pub(crate) async fn establish<N: Notifier + ?Sized>(
    notifier: &N,
    interest_set: &[String],
) -> Result<()> {
    // Subscribe before connecting so no event is missed.
    let mut events = notifier.events();
    let mut first_attempt = notifier.connect();
    let mut first_attempt_settled = false;

    loop {
        tokio::select! {
            result = &mut first_attempt, if !first_attempt_settled => {
                first_attempt_settled = true;
                match result {
                    Ok(()) => break,
                    Err(err) if err.is_connection_refused() => {
                        tracing::warn!(error = %err, "Connection refused, waiting for notifier to retry");
                    }
                    Err(err) => return Err(Error::Connection(err)),
                }
            }
            event = events.recv() => match event {
                Ok(NotifierEvent::Connected) => break,
                Ok(NotifierEvent::Error(err)) => return Err(Error::Connection((*err).clone())),
                Ok(NotifierEvent::Reconnecting { attempt }) => {
                    tracing::debug!(attempt, "Notifier reconnecting");
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Missed notifier events while connecting");
                }
                Err(RecvError::Closed) => return Err(Error::EventStreamClosed),
            }
        }
    }

    listen_all(notifier, interest_set).await
}

/// Listen to every channel concurrently, failing on the first error.
pub(crate) async fn listen_all<N: Notifier + ?Sized>(notifier: &N, channels: &[String]) -> Result<()> {
    let registrations = channels.iter().map(|channel| async move {
        notifier
            .listen_to(channel)
            .await
            .map_err(|source| Error::Listen {
                channel: channel.clone(),
                source,
            })
    });
    try_join_all(registrations).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NotifierOptions;
    use crate::error::NotifierError;
    use crate::transport::MemoryBroker;
    use std::time::Duration;

    fn channels(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    fn fast_retry() -> NotifierOptions {
        NotifierOptions {
            retry_interval: Duration::from_millis(10),
            retry_timeout: Duration::from_secs(5),
            ..NotifierOptions::default()
        }
    }

    #[tokio::test]
    async fn test_establish_listens_to_interest_set() {
        let broker = MemoryBroker::new();
        let notifier = broker.notifier(NotifierOptions::default());

        establish(&notifier, &channels(&["orders", "error"]))
            .await
            .unwrap();
        assert_eq!(notifier.listening_channels(), vec!["error", "orders"]);
    }

    #[tokio::test]
    async fn test_refused_attempt_waits_for_background_connect() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let notifier = broker.notifier(fast_retry());

        let waker = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            waker.set_available(true);
        });

        establish(&notifier, &channels(&["a"])).await.unwrap();
        assert!(notifier.is_listening("a"));
    }

    #[tokio::test]
    async fn test_exotic_failure_rejects() {
        let broker = MemoryBroker::new();
        broker.fail_next_connect("no pg_hba.conf entry");
        let notifier = broker.notifier(NotifierOptions::default());

        let err = establish(&notifier, &channels(&["a"])).await.unwrap_err();
        assert!(matches!(err, Error::Connection(NotifierError::Connect(_))));
    }

    #[tokio::test]
    async fn test_error_event_rejects() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let notifier = broker.notifier(NotifierOptions {
            retry_limit: Some(1),
            ..fast_retry()
        });

        let err = establish(&notifier, &channels(&["a"])).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(NotifierError::RetriesExhausted { attempts: 1 })
        ));
    }

    #[tokio::test]
    async fn test_listen_failure_rejects() {
        let broker = MemoryBroker::new();
        broker.fail_listen("secret");
        let notifier = broker.notifier(NotifierOptions::default());

        let err = establish(&notifier, &channels(&["open", "secret"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Listen { ref channel, .. } if channel == "secret"));
    }
}
