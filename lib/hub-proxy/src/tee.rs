//! Split one upstream body between the client and the cache writer

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Duplicate `upstream` into a client stream and a cache stream
///
/// The client side is bounded and paces the upstream read. The cache side
/// never blocks it: once the cache writer falls `capacity` chunks behind,
/// its copy is abandoned and its stream ends early, which the writer sees as
/// an undecodable body. When one side goes away the other keeps receiving.
/// An upstream error reaches the client and ends the cache side without it,
/// so a truncated body is never mistaken for a complete one.
pub fn tee<S, E>(mut upstream: S, capacity: usize) -> (ReceiverStream<Result<Bytes, E>>, ReceiverStream<Bytes>)
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: Send + 'static,
{
    let (client_tx, client_rx) = mpsc::channel(capacity.max(1));
    let (cache_tx, cache_rx) = mpsc::channel(capacity.max(1));

    tokio::spawn(async move {
        let mut client = Some(client_tx);
        let mut cache = Some(cache_tx);

        while let Some(item) = upstream.next().await {
            match item {
                Ok(chunk) => {
                    if let Some(tx) = &cache {
                        match tx.try_send(chunk.clone()) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                warn!("Cache writer fell behind, abandoning cache fill");
                                cache = None;
                            }
                            Err(TrySendError::Closed(_)) => {
                                debug!("Cache side of response closed");
                                cache = None;
                            }
                        }
                    }
                    if let Some(tx) = &client {
                        if tx.send(Ok(chunk)).await.is_err() {
                            debug!("Client side of response closed");
                            client = None;
                        }
                    }
                }
                Err(e) => {
                    cache = None;
                    if let Some(tx) = &client {
                        let _ = tx.send(Err(e)).await;
                    }
                    return;
                }
            }
            if client.is_none() && cache.is_none() {
                return;
            }
        }
    });

    (ReceiverStream::new(client_rx), ReceiverStream::new(cache_rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn chunks(parts: &[&'static str]) -> Vec<Result<Bytes, String>> {
        parts.iter().map(|p| Ok(Bytes::from_static(p.as_bytes()))).collect()
    }

    #[tokio::test]
    async fn test_both_sides_see_every_chunk() {
        let (client, cache) = tee(stream::iter(chunks(&["a", "b", "c"])), 4);
        let cache_task = tokio::spawn(async move { cache.collect::<Vec<_>>().await });
        let client: Vec<_> = client.map(|c| c.unwrap()).collect().await;
        assert_eq!(client, vec!["a", "b", "c"]);
        assert_eq!(cache_task.await.unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_client_continues_after_cache_drops() {
        let (client, cache) = tee(stream::iter(chunks(&["a", "b", "c"])), 1);
        drop(cache);
        let client: Vec<_> = client.map(|c| c.unwrap()).collect().await;
        assert_eq!(client, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_cache_continues_after_client_drops() {
        let (client, cache) = tee(stream::iter(chunks(&["a", "b"])), 4);
        drop(client);
        let cached: Vec<_> = cache.collect().await;
        assert_eq!(cached, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_stalled_cache_does_not_block_client() {
        let parts: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        let items: Vec<Result<Bytes, String>> = parts.iter().map(|p| Ok(Bytes::from(p.clone()))).collect();
        let (client, cache) = tee(stream::iter(items), 2);

        // Nobody reads the cache side while the client drains.
        let client = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            client.map(|c| c.unwrap()).collect::<Vec<_>>(),
        )
        .await
        .expect("client blocked behind the cache writer");
        assert_eq!(client, parts);

        let cached: Vec<_> = cache.collect().await;
        assert_eq!(cached, vec!["0", "1"]);
    }

    #[tokio::test]
    async fn test_error_ends_cache_without_it() {
        let mut items = chunks(&["a"]);
        items.push(Err("reset".to_string()));
        items.extend(chunks(&["b"]));
        let (client, cache) = tee(stream::iter(items), 4);

        let cached: Vec<_> = cache.collect().await;
        assert_eq!(cached, vec!["a"]);
        let client: Vec<_> = client.collect().await;
        assert_eq!(client.len(), 2);
        assert!(client[1].is_err());
    }
}
