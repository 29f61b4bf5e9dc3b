//! Tests for the block-aligned caching transport: alignment, hit counts,
//! in-flight deduplication, and failure behavior.

use std::sync::Arc;

use anyhow::Result;
use httpfile::{
    BlockCache, BlockCacheTransport, Error, HttpFile, HttpRangeReader, MemoryBlockCache,
    MmapBlockCache, Transport,
};
use mockito::{Matcher, Mock, ServerGuard};
use reqwest::header::RANGE;
use reqwest::{Method, Request};

/// 4096 bytes of repeating A..Z, the shape of the historical tests.
fn origin_data() -> Vec<u8> {
    (0..4096).map(|i| b'A' + (i % 26) as u8).collect()
}

/// 206 responder for one exact aligned `bytes=start-end` request.
async fn mock_block_fetch(
    server: &mut ServerGuard,
    data: &[u8],
    start: usize,
    end: usize,
    hits: usize,
) -> Mock {
    server
        .mock("GET", "/data")
        .match_header("range", format!("bytes={start}-{end}").as_str())
        .with_status(206)
        .with_header(
            "content-range",
            &format!("bytes {start}-{end}/{}", data.len()),
        )
        .with_body(&data[start..=end.min(data.len() - 1)])
        .expect(hits)
        .create_async()
        .await
}

fn caching_transport(block_size: u64) -> Arc<BlockCacheTransport> {
    Arc::new(
        BlockCacheTransport::new(
            Arc::new(reqwest::Client::new()),
            Some(Arc::new(MemoryBlockCache::new())),
        )
        .with_block_size(block_size),
    )
}

fn range_request(server: &ServerGuard, range: &str) -> Request {
    let url = format!("{}/data", server.url()).parse().unwrap();
    let mut req = Request::new(Method::GET, url);
    req.headers_mut().insert(RANGE, range.parse().unwrap());
    req
}

async fn fetch_body(transport: &BlockCacheTransport, server: &ServerGuard, range: &str) -> Result<Vec<u8>> {
    let resp = transport.round_trip(range_request(server, range)).await?;
    assert_eq!(resp.status().as_u16(), 206);
    Ok(resp.bytes().await?.to_vec())
}

#[tokio::test]
async fn sub_block_request_is_cached() -> Result<()> {
    let data = origin_data();
    let mut server = mockito::Server::new_async().await;
    let origin = mock_block_fetch(&mut server, &data, 0, 511, 1).await;

    let transport = caching_transport(512);

    let body = fetch_body(&transport, &server, "bytes=0-127").await?;
    assert_eq!(body, &data[0..=127]);

    // Another sub-range of the same block: no new origin traffic.
    let body = fetch_body(&transport, &server, "bytes=100-200").await?;
    assert_eq!(body.len(), 101);
    assert_eq!(body, &data[100..=200]);

    origin.assert_async().await;
    Ok(())
}

#[tokio::test]
async fn distinct_blocks_fetch_separately() -> Result<()> {
    let data = origin_data();
    let mut server = mockito::Server::new_async().await;
    let block0 = mock_block_fetch(&mut server, &data, 0, 511, 1).await;
    let block1 = mock_block_fetch(&mut server, &data, 512, 1023, 1).await;

    let transport = caching_transport(512);

    fetch_body(&transport, &server, "bytes=0-255").await?;
    fetch_body(&transport, &server, "bytes=600-700").await?;
    // Block 0 again: served from cache.
    fetch_body(&transport, &server, "bytes=100-200").await?;

    block0.assert_async().await;
    block1.assert_async().await;
    Ok(())
}

#[tokio::test]
async fn unaligned_request_spanning_blocks_coalesces() -> Result<()> {
    let data = origin_data();
    let mut server = mockito::Server::new_async().await;
    let origin = mock_block_fetch(&mut server, &data, 0, 1023, 1).await;

    let transport = caching_transport(512);
    let body = fetch_body(&transport, &server, "bytes=400-550").await?;
    assert_eq!(body.len(), 151);
    assert_eq!(body, &data[400..=550]);

    origin.assert_async().await;
    Ok(())
}

#[tokio::test]
async fn final_block_then_cache_hit() -> Result<()> {
    let data = origin_data();
    let mut server = mockito::Server::new_async().await;
    let origin = mock_block_fetch(&mut server, &data, 3584, 4095, 1).await;

    let transport = caching_transport(512);

    let body = fetch_body(&transport, &server, "bytes=3584-4095").await?;
    assert_eq!(body.len(), 512);
    assert_eq!(body, &data[3584..=4095]);

    // Interior sub-range of the now-cached block: zero origin requests.
    let body = fetch_body(&transport, &server, "bytes=3600-3700").await?;
    assert_eq!(body.len(), 101);
    assert_eq!(body, &data[3600..=3700]);

    origin.assert_async().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_identical_requests_fetch_once() -> Result<()> {
    let data = origin_data();
    let mut server = mockito::Server::new_async().await;
    let origin = mock_block_fetch(&mut server, &data, 0, 511, 1).await;

    let transport = caching_transport(512);
    let server = Arc::new(server);

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let transport = Arc::clone(&transport);
        let server = Arc::clone(&server);
        tasks.push(tokio::spawn(async move {
            let resp = transport
                .round_trip(range_request(&server, "bytes=0-100"))
                .await?;
            httpfile::Result::Ok(resp.bytes().await?.to_vec())
        }));
    }
    for task in tasks {
        let body = task.await??;
        assert_eq!(body, &data[0..=100]);
    }

    origin.assert_async().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn warm_cache_survives_a_thundering_herd() -> Result<()> {
    let data = origin_data();
    let mut server = mockito::Server::new_async().await;
    let origin = mock_block_fetch(&mut server, &data, 0, 511, 1).await;

    let transport = caching_transport(512);
    let server = Arc::new(server);

    // Warm-up.
    fetch_body(&transport, &server, "bytes=0-255").await?;

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let transport = Arc::clone(&transport);
        let server = Arc::clone(&server);
        tasks.push(tokio::spawn(async move {
            let resp = transport
                .round_trip(range_request(&server, "bytes=0-127"))
                .await?;
            httpfile::Result::Ok(resp.bytes().await?.to_vec())
        }));
    }
    for task in tasks {
        assert_eq!(task.await??, &data[0..=127]);
    }

    origin.assert_async().await;
    Ok(())
}

#[tokio::test]
async fn identical_requests_return_identical_bodies() -> Result<()> {
    let data = origin_data();
    let mut server = mockito::Server::new_async().await;
    mock_block_fetch(&mut server, &data, 1024, 1535, 1).await;

    let transport = caching_transport(512);
    let first = fetch_body(&transport, &server, "bytes=1100-1300").await?;
    let second = fetch_body(&transport, &server, "bytes=1100-1300").await?;
    assert_eq!(first, second);
    Ok(())
}

#[tokio::test]
async fn open_ended_range_is_one_block() -> Result<()> {
    let data = origin_data();
    let mut server = mockito::Server::new_async().await;
    // "bytes=512-" is given a synthetic end one block long.
    let origin = mock_block_fetch(&mut server, &data, 512, 1023, 1).await;

    let transport = caching_transport(512);
    let body = fetch_body(&transport, &server, "bytes=512-").await?;
    assert_eq!(body, &data[512..=1023]);

    origin.assert_async().await;
    Ok(())
}

#[tokio::test]
async fn default_block_size_applies() -> Result<()> {
    let data = origin_data();
    let mut server = mockito::Server::new_async().await;
    let origin = mock_block_fetch(&mut server, &data, 0, 511, 1).await;

    // No block size configured: 512 is the default alignment.
    let cache: Arc<MemoryBlockCache> = Arc::new(MemoryBlockCache::new());
    let transport = BlockCacheTransport::new(
        Arc::new(reqwest::Client::new()),
        Some(cache.clone() as Arc<dyn BlockCache>),
    );

    let resp = transport
        .round_trip(range_request(&server, "bytes=0-100"))
        .await?;
    assert_eq!(resp.bytes().await?.len(), 101);

    origin.assert_async().await;
    assert!(cache.get(0).is_some(), "block 0 should be cached");
    Ok(())
}

#[tokio::test]
async fn synthesized_response_shape() -> Result<()> {
    let data = origin_data();
    let mut server = mockito::Server::new_async().await;
    mock_block_fetch(&mut server, &data, 0, 511, 1).await;

    let transport = caching_transport(512);
    let resp = transport
        .round_trip(range_request(&server, "bytes=10-19"))
        .await?;

    assert_eq!(resp.status().as_u16(), 206);
    assert_eq!(resp.version(), reqwest::Version::HTTP_11);
    assert_eq!(
        resp.headers().get("content-range").unwrap(),
        "bytes 10-19/*"
    );
    assert!(resp.headers().get("etag").is_none());
    assert_eq!(resp.bytes().await?.len(), 10);
    Ok(())
}

#[tokio::test]
async fn non_get_requests_pass_through() -> Result<()> {
    let mut server = mockito::Server::new_async().await;
    let origin = server
        .mock("POST", "/data")
        .with_status(200)
        .with_body("ok")
        .expect(1)
        .create_async()
        .await;

    let transport = caching_transport(512);
    let url = format!("{}/data", server.url()).parse()?;
    let resp = transport.round_trip(Request::new(Method::POST, url)).await?;
    assert_eq!(resp.status().as_u16(), 200);

    origin.assert_async().await;
    Ok(())
}

#[tokio::test]
async fn rangeless_and_malformed_requests_pass_through() -> Result<()> {
    let data = origin_data();
    let mut server = mockito::Server::new_async().await;
    let plain = server
        .mock("GET", "/data")
        .match_header("range", Matcher::Missing)
        .with_body(&data)
        .expect(1)
        .create_async()
        .await;
    let suffix = server
        .mock("GET", "/data")
        .match_header("range", "bytes=-500")
        .with_status(206)
        .with_body(&data[3596..])
        .expect(1)
        .create_async()
        .await;

    let transport = caching_transport(512);
    let url: reqwest::Url = format!("{}/data", server.url()).parse()?;

    // No Range header at all.
    transport
        .round_trip(Request::new(Method::GET, url.clone()))
        .await?;
    // A suffix range the block logic does not understand is forwarded.
    transport
        .round_trip(range_request(&server, "bytes=-500"))
        .await?;

    plain.assert_async().await;
    suffix.assert_async().await;
    Ok(())
}

#[tokio::test]
async fn absent_cache_disables_caching() -> Result<()> {
    let data = origin_data();
    let mut server = mockito::Server::new_async().await;
    let origin = server
        .mock("GET", "/data")
        .match_header("range", "bytes=0-127")
        .with_status(206)
        .with_header("content-range", "bytes 0-127/4096")
        .with_body(&data[0..=127])
        .expect(2)
        .create_async()
        .await;

    let transport = BlockCacheTransport::new(Arc::new(reqwest::Client::new()), None);
    for _ in 0..2 {
        let resp = transport
            .round_trip(range_request(&server, "bytes=0-127"))
            .await?;
        assert_eq!(resp.bytes().await?.len(), 128);
    }

    origin.assert_async().await;
    Ok(())
}

#[tokio::test]
async fn origin_errors_cache_nothing() -> Result<()> {
    let mut server = mockito::Server::new_async().await;
    let origin = server
        .mock("GET", "/data")
        .match_header("range", "bytes=0-511")
        .with_status(500)
        .expect(2)
        .create_async()
        .await;

    let transport = caching_transport(512);
    for _ in 0..2 {
        let err = transport
            .round_trip(range_request(&server, "bytes=0-127"))
            .await
            .unwrap_err();
        match err {
            Error::UnexpectedStatus(status) => assert_eq!(status.as_u16(), 500),
            other => panic!("expected UnexpectedStatus, got {other:?}"),
        }
    }

    // Both attempts reached the origin: the failure was not cached.
    origin.assert_async().await;
    Ok(())
}

#[tokio::test]
async fn precondition_failure_evicts_and_errors() -> Result<()> {
    let data = origin_data();
    let mut server = mockito::Server::new_async().await;
    mock_block_fetch(&mut server, &data, 0, 511, 1).await;
    let changed = server
        .mock("GET", "/data")
        .match_header("range", "bytes=512-1023")
        .with_status(412)
        .expect(2)
        .create_async()
        .await;

    let transport = caching_transport(512);

    // Block 0 caches fine.
    fetch_body(&transport, &server, "bytes=0-100").await?;

    // Block 1 hits a changed resource: distinguished error, nothing
    // cached, and the retry goes back to the origin instead of serving
    // stale bytes.
    for _ in 0..2 {
        let err = fetch_body(&transport, &server, "bytes=600-700")
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::ResourceChanged)
        ));
    }
    changed.assert_async().await;
    Ok(())
}

#[tokio::test]
async fn mmap_cache_plugs_into_the_transport() -> Result<()> {
    let data = origin_data();
    let mut server = mockito::Server::new_async().await;
    let origin = mock_block_fetch(&mut server, &data, 1024, 1535, 1).await;

    let cache = Arc::new(MmapBlockCache::new(4096, 512)?);
    let transport = BlockCacheTransport::new(
        Arc::new(reqwest::Client::new()),
        Some(cache.clone() as Arc<dyn BlockCache>),
    )
    .with_block_size(512);

    let resp = transport
        .round_trip(range_request(&server, "bytes=1100-1300"))
        .await?;
    assert_eq!(resp.bytes().await?.to_vec(), &data[1100..=1300]);

    // Second pass served from the mapped region.
    let resp = transport
        .round_trip(range_request(&server, "bytes=1100-1300"))
        .await?;
    assert_eq!(resp.bytes().await?.to_vec(), &data[1100..=1300]);

    origin.assert_async().await;
    assert_eq!(cache.get(2).unwrap().len(), 512);
    Ok(())
}

#[tokio::test]
async fn reader_through_cache_covers_the_resource() -> Result<()> {
    let data = origin_data();
    let mut server = mockito::Server::new_async().await;
    server
        .mock("HEAD", "/data")
        .with_header("content-length", "4096")
        .with_header("accept-ranges", "bytes")
        .create_async()
        .await;
    // Sequential 600-byte reads trigger exactly these coalesced aligned
    // fetches, each once.
    let fetches = [
        (0usize, 1023usize),
        (1024, 1535),
        (1536, 2047),
        (2048, 2559),
        (2560, 3071),
        (3072, 4095),
    ];
    let mut mocks = Vec::new();
    for (start, end) in fetches {
        mocks.push(mock_block_fetch(&mut server, &data, start, end, 1).await);
    }

    let transport = caching_transport(512);
    let reader = HttpRangeReader::open(format!("{}/data", server.url()), transport).await?;
    let file = HttpFile::new(Arc::new(reader));

    let mut collected = Vec::new();
    let mut buf = [0u8; 600];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        collected.extend_from_slice(&buf[..n]);
    }
    assert_eq!(collected, data, "partitioned reads reassemble the resource");
    assert_eq!(file.transferred_bytes(), 4096);

    for mock in mocks {
        mock.assert_async().await;
    }
    Ok(())
}
