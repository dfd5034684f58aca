use bytes::Bytes;
use std::future::Future;
use tablesnap_core::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinSet;
use tracing::debug;

/// A part acknowledged by the remote side of a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub number: i32,
    pub etag: String,
}

/// Reads up to `part_size` bytes, returning fewer only at end of stream.
pub async fn read_part<R>(reader: &mut R, key: &str, part_size: usize) -> Result<Bytes>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = Vec::with_capacity(part_size);
    (&mut *reader)
        .take(part_size as u64)
        .read_to_end(&mut buf)
        .await
        .map_err(|source| Error::Transfer {
            key: key.to_string(),
            source,
        })?;
    Ok(Bytes::from(buf))
}

/// Uploads `first` and every following `part_size` chunk of `reader` with at
/// most `concurrency` parts in flight.
///
/// Memory stays bounded by `(concurrency + 1) * part_size`: a new part is only
/// read once a slot is free. The first failed part aborts the remaining ones
/// and its error is returned as is. Parts come back sorted by number.
pub async fn upload_parts<R, F, Fut>(
    reader: &mut R,
    key: &str,
    first: Bytes,
    part_size: usize,
    concurrency: usize,
    upload: F,
) -> Result<Vec<CompletedPart>>
where
    R: AsyncRead + Unpin + ?Sized,
    F: Fn(i32, Bytes) -> Fut,
    Fut: Future<Output = Result<String>> + Send + 'static,
{
    let concurrency = concurrency.max(1);
    let mut in_flight = JoinSet::new();
    let mut completed = Vec::new();
    let mut number = 0i32;
    let mut next = Some(first);

    while let Some(chunk) = next.take() {
        while in_flight.len() >= concurrency {
            collect_one(&mut in_flight, &mut completed).await?;
        }

        number += 1;
        debug!(key, part = number, size = chunk.len(), "Uploading part");
        let part = upload(number, chunk);
        in_flight.spawn(async move { (number, part.await) });

        let following = read_part(reader, key, part_size).await?;
        if !following.is_empty() {
            next = Some(following);
        }
    }

    while !in_flight.is_empty() {
        collect_one(&mut in_flight, &mut completed).await?;
    }

    completed.sort_by_key(|part| part.number);
    Ok(completed)
}

async fn collect_one(
    in_flight: &mut JoinSet<(i32, Result<String>)>,
    completed: &mut Vec<CompletedPart>,
) -> Result<()> {
    match in_flight.join_next().await {
        Some(Ok((number, Ok(etag)))) => {
            completed.push(CompletedPart { number, etag });
            Ok(())
        }
        Some(Ok((_, Err(e)))) => Err(e),
        Some(Err(e)) => Err(Error::Other(format!("part upload task failed: {}", e))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_read_part_stops_at_part_size() {
        let data = vec![7u8; 25];
        let mut reader = &data[..];
        let first = read_part(&mut reader, "k", 10).await.unwrap();
        let second = read_part(&mut reader, "k", 10).await.unwrap();
        let third = read_part(&mut reader, "k", 10).await.unwrap();
        let fourth = read_part(&mut reader, "k", 10).await.unwrap();
        assert_eq!((first.len(), second.len(), third.len(), fourth.len()), (10, 10, 5, 0));
    }

    #[tokio::test]
    async fn test_parts_are_ordered_and_complete() {
        let data: Vec<u8> = (0..95u8).collect();
        let mut reader = &data[..];
        let first = read_part(&mut reader, "k", 10).await.unwrap();

        let received = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = received.clone();
        let parts = upload_parts(&mut reader, "k", first, 10, 3, |number, body| {
            let sink = sink.clone();
            async move {
                // Later parts finish first.
                tokio::time::sleep(Duration::from_millis(20 - number as u64)).await;
                sink.lock().unwrap().push((number, body));
                Ok(format!("etag-{}", number))
            }
        })
        .await
        .unwrap();

        assert_eq!(parts.len(), 10);
        for (i, part) in parts.iter().enumerate() {
            assert_eq!(part.number, i as i32 + 1);
            assert_eq!(part.etag, format!("etag-{}", i + 1));
        }

        let mut received = received.lock().unwrap().clone();
        received.sort_by_key(|(n, _)| *n);
        let joined: Vec<u8> = received.iter().flat_map(|(_, b)| b.to_vec()).collect();
        assert_eq!(joined, data);
    }

    #[tokio::test]
    async fn test_in_flight_parts_are_bounded() {
        let data = vec![1u8; 200];
        let mut reader = &data[..];
        let first = read_part(&mut reader, "k", 10).await.unwrap();

        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (c, p) = (current.clone(), peak.clone());
        upload_parts(&mut reader, "k", first, 10, 4, move |number, _body| {
            let (current, peak) = (c.clone(), p.clone());
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(number.to_string())
            }
        })
        .await
        .unwrap();

        let peak = peak.load(Ordering::SeqCst);
        assert!(peak <= 4, "peak {} exceeds pool size", peak);
        assert!(peak >= 2, "parts never overlapped");
    }

    #[tokio::test]
    async fn test_failed_part_fails_upload() {
        let data = vec![1u8; 50];
        let mut reader = &data[..];
        let first = read_part(&mut reader, "k", 10).await.unwrap();
        let result = upload_parts(&mut reader, "k", first, 10, 2, |number, _body| async move {
            if number == 3 {
                Err(Error::Other("part rejected".to_string()))
            } else {
                Ok(String::new())
            }
        })
        .await;
        assert!(matches!(result, Err(Error::Other(msg)) if msg == "part rejected"));
    }
}
