use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::*;
use crate::api;
use crate::registry;
use crate::transport::pipe::{pipe, PipeTransport};

async fn create_link_pair(name: &str) -> Result<(Arc<Link>, Arc<Link>)> {
    create_link_pair_with_buffer(name, 0, 0).await
}

async fn create_link_pair_with_buffer(
    name: &str,
    client_max: u32,
    server_max: u32,
) -> Result<(Arc<Link>, Arc<Link>)> {
    let (ta, tb) = pipe();

    let server_name = format!("{name}-server");
    let server_task = tokio::spawn(async move {
        Link::serve(Config {
            transport: Arc::new(tb),
            max_stream_buffer_size: server_max,
            name: server_name,
        })
        .await
    });

    let client = Link::connect(Config {
        transport: Arc::new(ta),
        max_stream_buffer_size: client_max,
        name: format!("{name}-client"),
    })
    .await?;

    let server = server_task
        .await
        .map_err(|e| Error::Other(e.to_string()))??;
    Ok((client, server))
}

async fn close_pair(client: Arc<Link>, server: Arc<Link>) {
    client.close().await;
    server.close().await;
}

fn rtt_payload(sec: u64, nsec: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(16);
    buf.put_u64_le(sec);
    buf.put_u32_le(nsec);
    buf.put_u32_le(0);
    buf.freeze()
}

fn parse_rtt(data: &Bytes) -> (u64, u32) {
    let mut reader = data.clone();
    (reader.get_u64_le(), reader.get_u32_le())
}

#[tokio::test]
async fn test_ping_handshake_brings_link_up() -> Result<()> {
    let (client, server) = create_link_pair("handshake").await?;
    assert_eq!(client.link_state(), LinkState::Up);
    assert_eq!(server.link_state(), LinkState::Up);
    assert!(registry::get(client.id()).is_some());
    assert!(registry::get(server.id()).is_some());
    close_pair(client, server).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_echo_roundtrip() -> Result<()> {
    let (client, server) = create_link_pair("rtt").await?;

    let server_stream = server.open_stream("rtt", 1024).await?;
    let client_stream = client.open_stream("rtt", 1024).await?;
    assert_eq!(server_stream, client_stream);

    const ROUNDS: u64 = 1000;

    let echo_server = Arc::clone(&server);
    let server_task = tokio::spawn(async move {
        for _ in 0..ROUNDS {
            let packet = echo_server.read(server_stream, None).await?;
            let (sec, _) = parse_rtt(&packet.data);
            echo_server.release(server_stream).await?;
            echo_server
                .write(server_stream, rtt_payload(sec, ((sec + 100) * 2) as u32), None)
                .await?;
        }
        Result::<()>::Ok(())
    });

    for i in 1..=ROUNDS {
        client.write(client_stream, rtt_payload(i, 0), None).await?;
        let reply = client.read(client_stream, None).await?;
        let (sec, nsec) = parse_rtt(&reply.data);
        assert_eq!(sec, i);
        assert_eq!(nsec as u64, (i + 100) * 2);
        client.release(client_stream).await?;
    }

    server_task.await.map_err(|e| Error::Other(e.to_string()))??;
    close_pair(client, server).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_multi_stream_interleave() -> Result<()> {
    use rand::seq::SliceRandom;

    const STREAMS: usize = 8;
    const PACKETS: usize = 40;
    const PACKET_SIZE: usize = 4096;

    let (client, server) = create_link_pair("interleave").await?;

    fn pattern(stream: usize, seq: usize, len: usize) -> Bytes {
        let tag = (stream * 31 + seq) as u8;
        Bytes::from(vec![tag, stream as u8, seq as u8].repeat(len / 3 + 1)[..len].to_vec())
    }

    // one echo-verify task per stream on the server side
    let mut server_tasks = vec![];
    for k in 0..STREAMS {
        let server = Arc::clone(&server);
        server_tasks.push(tokio::spawn(async move {
            let sid = server.open_stream(&format!("test_{k}"), 64).await?;
            for seq in 0..PACKETS {
                let packet = server.read(sid, None).await?;
                assert_eq!(
                    packet.data,
                    pattern(k, seq, PACKET_SIZE),
                    "stream {k} packet {seq} corrupted or out of order"
                );
                server.release(sid).await?;
            }
            server.write(sid, Bytes::from_static(b"done"), None).await?;
            Result::<()>::Ok(())
        }));
    }

    // clients open their streams in randomised order
    let mut order: Vec<usize> = (0..STREAMS).collect();
    order.shuffle(&mut rand::thread_rng());

    let mut client_tasks = vec![];
    for k in order {
        let client = Arc::clone(&client);
        client_tasks.push(tokio::spawn(async move {
            let sid = client
                .open_stream(&format!("test_{k}"), (PACKET_SIZE * 4) as u32)
                .await?;
            for seq in 0..PACKETS {
                client.write(sid, pattern(k, seq, PACKET_SIZE), None).await?;
            }
            let done = client.read(sid, None).await?;
            assert_eq!(done.data, Bytes::from_static(b"done"));
            client.release(sid).await?;
            Result::<()>::Ok(())
        }));
    }

    for task in client_tasks {
        task.await.map_err(|e| Error::Other(e.to_string()))??;
    }
    for task in server_tasks {
        task.await.map_err(|e| Error::Other(e.to_string()))??;
    }

    close_pair(client, server).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_backpressure_blocks_65th_write() -> Result<()> {
    const PACKET: usize = 1024;
    const POOL: usize = crate::pool::MAX_PACKETS_PER_STREAM;

    let (client, server) = create_link_pair("backpressure").await?;
    let sid = client
        .open_stream("bp", (POOL * PACKET) as u32)
        .await?;

    // the pool-count limit binds before the byte limit
    for i in 0..POOL {
        client
            .write(sid, Bytes::from(vec![i as u8; PACKET]), None)
            .await?;
    }
    assert_eq!(
        client.fill_level(sid, FillSide::Remote).await?,
        (POOL * PACKET) as u32
    );

    let blocked_client = Arc::clone(&client);
    let blocked = tokio::spawn(async move {
        blocked_client
            .write(sid, Bytes::from(vec![0xAB; PACKET]), None)
            .await
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!blocked.is_finished(), "65th write completed early");

    // one consumed packet releases exactly one writer
    let packet = server.read(sid, None).await?;
    assert_eq!(packet.length as usize, PACKET);
    server.release(sid).await?;

    tokio::time::timeout(Duration::from_secs(2), blocked)
        .await
        .expect("65th write still blocked after a release")
        .map_err(|e| Error::Other(e.to_string()))??;

    close_pair(client, server).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_graceful_close_with_pending_data() -> Result<()> {
    const PACKET: usize = 512;
    const COUNT: usize = 10;

    let (client, server) = create_link_pair("graceful").await?;
    let client_sid = client.open_stream("gc", (PACKET * COUNT) as u32).await?;
    let server_sid = server.open_stream("gc", 64).await?;
    assert_eq!(client_sid, server_sid);

    for i in 0..COUNT {
        client
            .write(client_sid, Bytes::from(vec![i as u8; PACKET]), None)
            .await?;
    }

    let closing_client = Arc::clone(&client);
    let close_task = tokio::spawn(async move { closing_client.close_stream(client_sid).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        !close_task.is_finished(),
        "close completed before the peer drained"
    );

    for _ in 0..COUNT {
        server.read(server_sid, None).await?;
        server.release(server_sid).await?;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    tokio::time::timeout(Duration::from_secs(2), close_task)
        .await
        .expect("close never completed")
        .map_err(|e| Error::Other(e.to_string()))??;

    server.close_stream(server_sid).await?;

    assert_eq!(client.fill_level(client_sid, FillSide::Local).await?, 0);
    assert_eq!(client.fill_level(client_sid, FillSide::Remote).await?, 0);
    assert_eq!(server.fill_level(server_sid, FillSide::Local).await?, 0);
    assert_eq!(server.fill_level(server_sid, FillSide::Remote).await?, 0);

    // the slot is reusable and the name resolves to a fresh id
    let reopened = client.open_stream("gc", 1024).await?;
    assert_ne!(reopened, client_sid);

    close_pair(client, server).await;
    Ok(())
}

/// Peer that completes the ping handshake, then never answers again.
async fn run_silent_peer(transport: PipeTransport) {
    use crate::codec;
    use crate::event::{Event, EventType};

    loop {
        let header = match codec::read_header(&transport).await {
            Ok(h) => h,
            Err(_) => return,
        };
        if header.typ == EventType::PingReq {
            let mut resp = Event::new(EventType::PingResp, 0, 0, 0);
            resp.header.id = header.id;
            resp.header.flags.acknowledge();
            if codec::write_event(&transport, &resp).await.is_err() {
                return;
            }
        }
        // anything else, including the reset request, is swallowed
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reset_timeout_on_unresponsive_peer() -> Result<()> {
    let (ta, tb) = pipe();
    tokio::spawn(run_silent_peer(tb));

    let client = Link::connect(Config {
        transport: Arc::new(ta),
        max_stream_buffer_size: 0,
        name: "silent-client".to_owned(),
    })
    .await?;
    let link_id = client.id();

    let down_count = Arc::new(AtomicUsize::new(0));
    let down_count2 = Arc::clone(&down_count);
    let cb = registry::add_link_down_callback(Arc::new(move |id| {
        if id == link_id {
            down_count2.fetch_add(1, Ordering::SeqCst);
        }
    }));

    let started = Instant::now();
    let result = client.reset(Some(500)).await;
    let elapsed = started.elapsed();

    assert_eq!(result, Err(Error::ErrTimeout));
    assert!(
        elapsed >= Duration::from_millis(450) && elapsed <= Duration::from_millis(1000),
        "reset took {elapsed:?}"
    );

    // callbacks fire exactly once, the link is dead afterwards
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(down_count.load(Ordering::SeqCst), 1);
    assert_eq!(
        client.open_stream("late", 64).await.unwrap_err(),
        Error::ErrCommunicationNotOpen
    );
    // the registry slot no longer resolves to this link
    if let Some(found) = registry::get(link_id) {
        assert!(!Arc::ptr_eq(&found, &client));
    }

    registry::remove_link_down_callback(cb);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_graceful_reset_completes_both_sides() -> Result<()> {
    let (client, server) = create_link_pair("reset").await?;
    let server_id = server.id();

    client.reset(Some(2000)).await?;

    // the peer side tears down on its own
    let started = Instant::now();
    while server.link_state() != LinkState::Down {
        if started.elapsed() > Duration::from_secs(2) {
            panic!("server side never went down");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(client.link_state(), LinkState::Down);
    if let Some(found) = registry::get(server_id) {
        assert!(!Arc::ptr_eq(&found, &server));
    }
    Ok(())
}

#[tokio::test]
async fn test_zero_timeout_read_never_blocks() -> Result<()> {
    let (client, server) = create_link_pair("zero-timeout").await?;
    let sid = client.open_stream("zt", 1024).await?;

    let started = Instant::now();
    let result = client.read(sid, Some(0)).await;
    assert_eq!(result.unwrap_err(), Error::ErrTimeout);
    assert!(started.elapsed() < Duration::from_millis(100));

    close_pair(client, server).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_timed_read_sees_late_packet_on_next_read() -> Result<()> {
    let (client, server) = create_link_pair("timed-read").await?;
    let client_sid = client.open_stream("tr", 1024).await?;
    let server_sid = server.open_stream("tr", 1024).await?;

    assert_eq!(
        client.read(client_sid, Some(50)).await.unwrap_err(),
        Error::ErrTimeout
    );

    // a write landing after the timeout is not lost
    server
        .write(server_sid, Bytes::from_static(b"late"), None)
        .await?;
    let packet = client.read(client_sid, Some(1000)).await?;
    assert_eq!(packet.data, Bytes::from_static(b"late"));
    client.release(client_sid).await?;

    close_pair(client, server).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_timed_write_timeout_keeps_link_healthy() -> Result<()> {
    const PACKET: usize = 256;
    let (client, server) = create_link_pair("timed-write").await?;
    let sid = client.open_stream("tw", PACKET as u32).await?;

    client
        .write(sid, Bytes::from(vec![1; PACKET]), None)
        .await?;

    // peer is full, the timed write gives up
    assert_eq!(
        client
            .write(sid, Bytes::from(vec![2; PACKET]), Some(100))
            .await
            .unwrap_err(),
        Error::ErrTimeout
    );
    assert_eq!(client.link_state(), LinkState::Up);

    // after the peer drains, the stream is usable again
    server.read(sid, None).await?;
    server.release(sid).await?;
    client
        .write(sid, Bytes::from(vec![3; PACKET]), Some(1000))
        .await?;
    let packet = server.read(sid, None).await?;
    assert_eq!(packet.data[0], 3);
    server.release(sid).await?;

    close_pair(client, server).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_move_read_transfers_ownership() -> Result<()> {
    let (client, server) = create_link_pair("move-read").await?;
    let client_sid = client.open_stream("mv", 4096).await?;
    let server_sid = server.open_stream("mv", 64).await?;

    client
        .write(client_sid, Bytes::from(vec![7u8; 100]), None)
        .await?;

    let packet = server.read_move(server_sid, None).await?;
    assert_eq!(packet.length, 100);
    assert!(packet.data.iter().all(|b| *b == 7));

    // the credit went back with the move; nothing is left to release
    assert_eq!(
        server.release(server_sid).await.unwrap_err(),
        Error::ErrNoPacketToRelease
    );

    // writer-side accounting settled
    let started = Instant::now();
    while client.fill_level(client_sid, FillSide::Remote).await? != 0 {
        if started.elapsed() > Duration::from_secs(1) {
            panic!("remote fill level never settled");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    api::deallocate_move_data(packet);
    close_pair(client, server).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_release_specific_out_of_order() -> Result<()> {
    let (client, server) = create_link_pair("rel-spec").await?;
    let client_sid = client.open_stream("rs", 4096).await?;
    let server_sid = server.open_stream("rs", 64).await?;

    for i in 1..=3u8 {
        client
            .write(client_sid, Bytes::from(vec![i; 64]), None)
            .await?;
    }

    let first = server.read(server_sid, None).await?;
    let second = server.read(server_sid, None).await?;
    assert_eq!(first.data[0], 1);
    assert_eq!(second.data[0], 2);

    // release the middle packet first, then the head
    server.release_specific(server_sid, &second).await?;
    server.release(server_sid).await?;

    // the unread third packet survived the compaction
    let third = server.read(server_sid, None).await?;
    assert_eq!(third.data[0], 3);
    server.release(server_sid).await?;

    let started = Instant::now();
    while client.fill_level(client_sid, FillSide::Remote).await? != 0 {
        if started.elapsed() > Duration::from_secs(1) {
            panic!("writer-side accounting never settled");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    close_pair(client, server).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_open_stream_larger_than_peer_grants() -> Result<()> {
    let (client, server) = create_link_pair_with_buffer("too-big", 0, 1024).await?;

    assert_eq!(
        client.open_stream("big", 4096).await.unwrap_err(),
        Error::ErrOutOfMemory
    );

    // a modest create on the same link still works
    let sid = client.open_stream("small", 512).await?;
    client
        .write(sid, Bytes::from_static(b"fits"), None)
        .await?;
    let packet = server.read(sid, None).await?;
    assert_eq!(packet.data, Bytes::from_static(b"fits"));
    server.release(sid).await?;

    close_pair(client, server).await;
    Ok(())
}

#[tokio::test]
async fn test_write_to_closed_stream_fails() -> Result<()> {
    let (client, server) = create_link_pair("closed-write").await?;
    let sid = client.open_stream("cw", 1024).await?;
    client.close_stream(sid).await?;

    assert_eq!(
        client
            .write(sid, Bytes::from_static(b"nope"), None)
            .await
            .unwrap_err(),
        Error::ErrStreamClosed
    );

    close_pair(client, server).await;
    Ok(())
}

#[tokio::test]
async fn test_stream_name_validation() -> Result<()> {
    let (client, server) = create_link_pair("names").await?;

    let long = "n".repeat(MAX_STREAM_NAME_LENGTH);
    assert_eq!(
        client.open_stream(&long, 64).await.unwrap_err(),
        Error::ErrStreamNameTooLong
    );
    assert_eq!(
        client.open_stream("", 64).await.unwrap_err(),
        Error::ErrStreamNameTooLong
    );
    assert_eq!(
        client.open_stream("héllo", 64).await.unwrap_err(),
        Error::ErrStreamNameNotAscii
    );

    close_pair(client, server).await;
    Ok(())
}

#[tokio::test]
async fn test_write_fd_unsupported_on_pipe() -> Result<()> {
    let (client, server) = create_link_pair("write-fd").await?;
    let sid = client.open_stream("fd", 64).await?;
    assert_eq!(
        client
            .write_fd(sid, Bytes::from_static(b"x"))
            .await
            .unwrap_err(),
        Error::ErrNotImplemented
    );
    close_pair(client, server).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scatter_write_arrives_as_one_packet() -> Result<()> {
    let (client, server) = create_link_pair("scatter").await?;
    let client_sid = client.open_stream("sc", 4096).await?;
    let server_sid = server.open_stream("sc", 64).await?;

    client
        .write2(
            client_sid,
            Bytes::from(vec![0xAA; 700]),
            Bytes::from(vec![0xBB; 300]),
        )
        .await?;

    let packet = server.read(server_sid, None).await?;
    assert_eq!(packet.length, 1000);
    assert!(packet.data[..700].iter().all(|b| *b == 0xAA));
    assert!(packet.data[700..].iter().all(|b| *b == 0xBB));
    server.release(server_sid).await?;

    close_pair(client, server).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_api_handle_surface() -> Result<()> {
    let (ta, tb) = pipe();

    let server_task = tokio::spawn(async move {
        api::server(Config {
            transport: Arc::new(tb),
            max_stream_buffer_size: 0,
            name: "api-server".to_owned(),
        })
        .await
    });

    let client_id = api::connect(Config {
        transport: Arc::new(ta),
        max_stream_buffer_size: 0,
        name: "api-client".to_owned(),
    })
    .await?;
    let server_id = server_task
        .await
        .map_err(|e| Error::Other(e.to_string()))??;
    let client_link = registry::get(client_id).expect("client link registered");
    let server_link = registry::get(server_id).expect("server link registered");

    let client_handle = api::open_stream(client_id, "api", 1024).await?;
    let server_handle = api::open_stream(server_id, "api", 1024).await?;

    let payload = Bytes::from_static(b"over the handles");
    api::write_data(client_handle, &payload).await?;

    let packet = api::read_data(server_handle).await?;
    assert_eq!(packet.data, payload);
    assert_eq!(
        api::get_fill_level(server_handle, FillSide::Local).await?,
        payload.len() as u32
    );
    api::release_data(server_handle).await?;

    api::reset_remote(client_id, 2000).await?;
    assert_eq!(client_link.link_state(), LinkState::Down);
    assert_eq!(
        client_link.open_stream("api2", 64).await.unwrap_err(),
        Error::ErrCommunicationNotOpen
    );

    // peer side observes the reset and tears down on its own
    let started = Instant::now();
    while server_link.link_state() != LinkState::Down {
        if started.elapsed() > Duration::from_secs(2) {
            panic!("server link never went down");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fill_level_invariants_under_load() -> Result<()> {
    const PACKET: usize = 512;
    const WRITE_SIZE: u32 = 8 * PACKET as u32;

    let (client, server) = create_link_pair("invariants").await?;
    let client_sid = client.open_stream("inv", WRITE_SIZE).await?;
    let server_sid = server.open_stream("inv", 64).await?;

    let writer = Arc::clone(&client);
    let writer_task = tokio::spawn(async move {
        for i in 0..64u32 {
            writer
                .write(client_sid, Bytes::from(vec![i as u8; PACKET]), None)
                .await?;
        }
        Result::<()>::Ok(())
    });

    for _ in 0..64 {
        let remote = client.fill_level(client_sid, FillSide::Remote).await?;
        assert!(remote <= WRITE_SIZE, "remote fill {remote} above write size");
        let local = server.fill_level(server_sid, FillSide::Local).await?;
        assert!(local <= WRITE_SIZE, "local fill {local} above read size");

        server.read(server_sid, None).await?;
        server.release(server_sid).await?;
    }

    writer_task
        .await
        .map_err(|e| Error::Other(e.to_string()))??;

    close_pair(client, server).await;
    Ok(())
}
