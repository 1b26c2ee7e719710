//! Watch subscriptions.
//!
//! Each batch delivered by the store is split into runs of consecutive
//! events sharing an action; the callback sees one [`Response`] per run, in
//! revision order. A transaction putting three keys therefore arrives as a
//! single PUT response with three rows, while PUT, DELETE, PUT arrives as
//! three responses.

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{BoxError, Client, ClientError, ClientResult};
use crate::op::{Action, KeyValue, OpOptions, Response};
use crate::store::{Event, EventType, StoreError, WatchBatch, WatchRequest};

fn event_action(event: &Event) -> Action {
    match event.event_type {
        EventType::Put => Action::Put,
        EventType::Delete => Action::Delete,
    }
}

/// Row reported for one event. Deletions report the removed pair when the
/// previous value was requested, otherwise the bare tombstone.
fn event_row(event: &Event, with_prev_kv: bool) -> KeyValue {
    match (event.event_type, &event.prev_kv) {
        (EventType::Delete, Some(prev)) if with_prev_kv => KeyValue::from_store(prev.clone(), false),
        (EventType::Delete, _) => KeyValue::from_store(event.kv.clone(), true),
        (EventType::Put, _) => KeyValue::from_store(event.kv.clone(), false),
    }
}

/// Splits a batch into per-action responses.
pub fn split_batch(batch: &WatchBatch, with_prev_kv: bool) -> Vec<Response> {
    let mut runs: Vec<Response> = Vec::new();
    for event in &batch.events {
        let action = event_action(event);
        let row = event_row(event, with_prev_kv);
        match runs.last_mut() {
            Some(run) if run.action == action => {
                run.count += 1;
                run.kvs.get_or_insert_with(Vec::new).push(row);
            }
            _ => runs.push(Response {
                action,
                succeeded: true,
                count: 1,
                kvs: Some(vec![row]),
                revision: batch.revision,
            }),
        }
    }
    runs
}

impl Client {
    /// Subscribes to changes of the key or range described by `op` and
    /// feeds them to `callback` until `cancel` fires.
    ///
    /// `op.revision` is the first revision delivered; 0 starts from the
    /// next change. Cancellation ends the watch with `Ok(())`. An error
    /// returned by the callback ends it and is passed back unchanged.
    pub async fn watch<F>(
        &self,
        op: &OpOptions,
        cancel: &CancellationToken,
        mut callback: F,
    ) -> ClientResult<()>
    where
        F: FnMut(&Response) -> Result<(), BoxError> + Send,
    {
        if op.key.is_empty() {
            return Err(ClientError::InvalidArgument("key must not be empty".into()));
        }
        if cancel.is_cancelled() {
            return Ok(());
        }

        let store = self.connection()?;
        let req = WatchRequest {
            key: op.key.clone(),
            range_end: op.range_end(),
            start_revision: op.revision,
            prev_kv: op.prev_kv,
        };
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            stream = self.timed(store.watch(req)) => stream?,
        };
        debug!(key = %String::from_utf8_lossy(&op.key), revision = op.revision, "watch started");

        loop {
            let batch = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("watch cancelled");
                    return Ok(());
                }
                next = stream.next() => match next {
                    Some(batch) => batch?,
                    None => {
                        warn!("watch stream closed by store");
                        return Err(ClientError::WatchClosed);
                    }
                },
            };

            if batch.canceled {
                let err = if batch.compact_revision > 0 {
                    StoreError::Compacted(batch.compact_revision)
                } else {
                    StoreError::Internal(batch.cancel_reason.clone())
                };
                warn!(error = %err, "watch cancelled by store");
                return Err(err.into());
            }

            for response in split_batch(&batch, op.prev_kv) {
                callback(&response).map_err(ClientError::Callback)?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::embedded::{EmbeddedConnector, EmbeddedStore};
    use crate::store::KeyValue as StoredKeyValue;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn stored(key: &str, value: &str, revision: i64) -> StoredKeyValue {
        StoredKeyValue {
            key: key.as_bytes().to_vec(),
            value: value.as_bytes().to_vec(),
            create_revision: revision,
            mod_revision: revision,
            version: 1,
            lease: 0,
        }
    }

    fn event(event_type: EventType, key: &str, prev: Option<&str>) -> Event {
        Event {
            event_type,
            kv: match event_type {
                EventType::Put => stored(key, "new", 9),
                EventType::Delete => StoredKeyValue {
                    key: key.as_bytes().to_vec(),
                    mod_revision: 9,
                    ..Default::default()
                },
            },
            prev_kv: prev.map(|value| stored(key, value, 3)),
        }
    }

    #[test]
    fn test_split_batch_groups_runs() {
        let batch = WatchBatch {
            revision: 9,
            events: vec![
                event(EventType::Put, "a", None),
                event(EventType::Put, "b", None),
                event(EventType::Delete, "c", Some("old")),
                event(EventType::Put, "d", None),
            ],
            ..Default::default()
        };

        let runs = split_batch(&batch, false);
        let shape: Vec<(Action, i64)> = runs.iter().map(|r| (r.action, r.count)).collect();
        assert_eq!(
            shape,
            vec![(Action::Put, 2), (Action::Delete, 1), (Action::Put, 1)]
        );
        assert!(runs.iter().all(|r| r.revision == 9));
        assert_eq!(runs[1].rows()[0].value, None);

        let runs = split_batch(&batch, true);
        assert_eq!(runs[1].rows()[0].value_str(), "old");
    }

    async fn client_with_store() -> (Arc<EmbeddedStore>, Client) {
        let store = EmbeddedStore::single_node("node1", "http://127.0.0.1:2379").unwrap();
        let client = Client::open(
            ClientConfig::default(),
            Arc::new(EmbeddedConnector::new(store.clone())),
        )
        .await;
        (store, client)
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let (store, client) = client_with_store().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        client
            .watch(&OpOptions::get("/w"), &cancel, |_| Ok(()))
            .await
            .unwrap();
        assert_eq!(store.watcher_count(), 0);
    }

    #[tokio::test]
    async fn test_callback_error_is_returned() {
        let (_store, client) = client_with_store().await;
        client.put(&OpOptions::put("/w/a", "1")).await.unwrap();

        let cancel = CancellationToken::new();
        let err = client
            .watch(
                &OpOptions::get("/w/").prefix().revision(1),
                &cancel,
                |_| Err("error".into()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Callback(_)));
        assert_eq!(err.to_string(), "error");
    }

    #[tokio::test]
    async fn test_watch_delivers_until_cancelled() {
        let (store, client) = client_with_store().await;
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let watcher = {
            let client = client.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                client
                    .watch(&OpOptions::get("/w/").prefix().prev_kv(), &cancel, move |resp| {
                        tx.send(resp.clone()).map_err(|e| e.to_string().into())
                    })
                    .await
            })
        };
        while store.watcher_count() == 0 {
            tokio::task::yield_now().await;
        }

        client.put(&OpOptions::put("/w/a", "1")).await.unwrap();
        client.delete(&OpOptions::delete("/w/a")).await.unwrap();

        let put = rx.recv().await.unwrap();
        assert_eq!(put.action, Action::Put);
        let delete = rx.recv().await.unwrap();
        assert_eq!(delete.action, Action::Delete);
        assert_eq!(delete.rows()[0].value_str(), "1");

        cancel.cancel();
        watcher.await.unwrap().unwrap();
        assert_eq!(store.watcher_count(), 0);
    }

    #[tokio::test]
    async fn test_compacted_start_revision() {
        let (_store, client) = client_with_store().await;
        for value in ["1", "2", "3"] {
            client.put(&OpOptions::put("/w/a", value)).await.unwrap();
        }
        client.compact(0).await.unwrap();

        let cancel = CancellationToken::new();
        let err = client
            .watch(&OpOptions::get("/w/a").revision(2), &cancel, |_| Ok(()))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Store(StoreError::Compacted(_))));
    }
}
