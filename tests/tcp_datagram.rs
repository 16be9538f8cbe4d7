mod common;
use anyhow::Result;
use common::{quiet_config, fast_config, start, Connection, Harness};
use serial_test::serial;
use toe_r::tcp::{
    config::ToeConfig,
    defs::{SendError, TcpError},
    packet::{TcpFlag, TcpPacket},
};

const MSS: usize = 1460;

fn expect_data(harness: &Harness, conn: &Connection, offset: u32, payload: &[u8]) -> Result<TcpPacket> {
    let segment = harness.expect_segment()?;
    anyhow::ensure!(
        segment.flag == TcpFlag::ACK | TcpFlag::PSH,
        "Expected data, got {:?}.",
        segment.flag
    );
    anyhow::ensure!(
        segment.seq_number == conn.engine_seq.wrapping_add(offset),
        "Data at {} instead of {}.",
        segment.seq_number,
        conn.engine_seq.wrapping_add(offset)
    );
    anyhow::ensure!(
        segment.payload == payload,
        "Unexpected payload of {} bytes.",
        segment.payload.len()
    );
    Ok(segment)
}

fn pattern(length: usize) -> Vec<u8> {
    (0..length).map(|i| (i % 251) as u8).collect()
}

#[test]
#[serial]
fn test_receive_and_read() -> Result<()> {
    let harness = start(quiet_config())?;
    let mut conn = harness.passive_open()?;
    harness.send_on(&conn, TcpFlag::ACK | TcpFlag::PSH, b"hello")?;

    let notification = harness.expect_notification(|n| n.length > 0)?;
    assert_eq!(notification.session_id, conn.id);
    assert_eq!(notification.length, 5);
    assert!(!notification.opened && !notification.closed);
    let ack = harness.expect_segment()?;
    assert_eq!(ack.flag, TcpFlag::ACK);
    assert_eq!(ack.seq_number, conn.engine_seq);
    assert_eq!(ack.ack_number, conn.peer_seq + 5);
    conn.peer_seq += 5;

    assert_eq!(harness.toe.read(conn.id, 2)?, b"he");
    assert_eq!(harness.toe.read(conn.id, 100)?, b"llo");
    assert!(harness.toe.read(conn.id, 100)?.is_empty());
    Ok(())
}

#[test]
#[serial]
fn test_duplicate_segment_is_acked_not_delivered() -> Result<()> {
    let harness = start(quiet_config())?;
    let conn = harness.passive_open()?;
    harness.send_on(&conn, TcpFlag::ACK | TcpFlag::PSH, b"once")?;
    harness.expect_notification(|n| n.length == 4)?;
    harness.expect_segment()?;

    harness.send_on(&conn, TcpFlag::ACK | TcpFlag::PSH, b"once")?;
    let ack = harness.expect_segment()?;
    assert_eq!(ack.flag, TcpFlag::ACK);
    assert_eq!(ack.ack_number, conn.peer_seq + 4);
    harness.expect_no_notification()?;
    assert_eq!(harness.toe.read(conn.id, 100)?, b"once");
    Ok(())
}

#[test]
#[serial]
fn test_out_of_order_segment_is_dropped() -> Result<()> {
    let harness = start(quiet_config())?;
    let conn = harness.passive_open()?;
    let ahead = harness.segment(
        conn.local_port,
        conn.peer_port,
        conn.peer_seq + 100,
        conn.engine_seq,
        TcpFlag::ACK | TcpFlag::PSH,
        b"later",
    );
    harness.send(ahead)?;
    let ack = harness.expect_segment()?;
    assert_eq!(ack.ack_number, conn.peer_seq);
    harness.expect_no_notification()?;
    assert!(harness.toe.read(conn.id, 100)?.is_empty());
    Ok(())
}

#[test]
#[serial]
fn test_send() -> Result<()> {
    let harness = start(quiet_config())?;
    let conn = harness.passive_open()?;
    let response = harness.toe.send(conn.id, b"abc")?;
    assert_eq!(response.error, SendError::None);
    assert_eq!(response.length, 3);
    let segment = expect_data(&harness, &conn, 0, b"abc")?;
    assert_eq!(segment.ack_number, conn.peer_seq);
    assert_eq!(segment.window_size, 0xffff);

    let response = harness.toe.send(conn.id, b"defg")?;
    assert_eq!(response.length, 4);
    expect_data(&harness, &conn, 3, b"defg")?;
    harness.wait_stats(|s| s.tcp_out_segs == 3)?;
    Ok(())
}

#[test]
#[serial]
fn test_send_refused() -> Result<()> {
    let harness = start(quiet_config())?;
    let conn = harness.passive_open()?;

    // Without Nagle one send is one segment.
    let response = harness.toe.send(conn.id, &pattern(MSS + 1))?;
    assert_eq!(response.error, SendError::NoSpace);
    assert_eq!(response.length, 0);

    let idle = (conn.id + 1) % harness.toe.config().max_sessions;
    let response = harness.toe.send(idle, b"abc")?;
    assert_eq!(response.error, SendError::NoConnection);
    assert_eq!(response.length, 0);

    let invalid = harness.toe.config().max_sessions;
    let err = harness.toe.send(invalid, b"abc").expect_err("send must fail");
    assert_eq!(
        err.downcast_ref::<TcpError>(),
        Some(&TcpError::InvalidSession { id: invalid })
    );
    harness.expect_no_segment()?;
    Ok(())
}

#[test]
#[serial]
fn test_fast_retransmit() -> Result<()> {
    let harness = start(quiet_config())?;
    let conn = harness.passive_open()?;
    let data = pattern(300);
    for (i, chunk) in data.chunks(100).enumerate() {
        harness.toe.send(conn.id, chunk)?;
        expect_data(&harness, &conn, (i * 100) as u32, chunk)?;
    }

    // The first segment is lost, every later one acknowledges the start.
    for _ in 0..2 {
        harness.send_on(&conn, TcpFlag::ACK, &[])?;
    }
    harness.expect_no_segment()?;
    harness.send_on(&conn, TcpFlag::ACK, &[])?;
    expect_data(&harness, &conn, 0, &data)?;

    // Only the third duplicate triggers.
    harness.send_on(&conn, TcpFlag::ACK, &[])?;
    harness.expect_no_segment()?;
    harness.wait_stats(|s| s.tcp_retrans_segs == 1)?;

    let all = Connection {
        engine_seq: conn.engine_seq + 300,
        ..conn
    };
    harness.send_on(&all, TcpFlag::ACK, &[])?;
    harness.expect_no_segment()?;
    Ok(())
}

#[test]
#[serial]
fn test_retransmission_timeout() -> Result<()> {
    let harness = start(fast_config())?;
    let conn = harness.passive_open()?;
    harness.toe.send(conn.id, b"lost")?;
    expect_data(&harness, &conn, 0, b"lost")?;
    expect_data(&harness, &conn, 0, b"lost")?;
    let stats = harness.wait_stats(|s| s.tcp_retrans_segs >= 1)?;
    assert_eq!(stats.tcp_out_segs, 2);

    let acked = Connection {
        engine_seq: conn.engine_seq + 4,
        ..conn
    };
    harness.send_on(&acked, TcpFlag::ACK, &[])?;
    let response = harness.toe.send(conn.id, b"next")?;
    assert_eq!(response.error, SendError::None);
    // Retransmissions still queued before the ACK may come first.
    loop {
        let segment = harness.expect_segment()?;
        if segment.payload == b"next" {
            assert_eq!(segment.seq_number, conn.engine_seq + 4);
            break;
        }
        assert_eq!(segment.payload, b"lost");
    }
    Ok(())
}

#[test]
#[serial]
fn test_ack_for_unsent_data_is_answered() -> Result<()> {
    let harness = start(quiet_config())?;
    let conn = harness.passive_open()?;
    harness.toe.send(conn.id, b"data")?;
    expect_data(&harness, &conn, 0, b"data")?;

    let beyond = Connection {
        engine_seq: conn.engine_seq + 5,
        ..conn
    };
    harness.send_on(&beyond, TcpFlag::ACK, &[])?;
    let ack = harness.expect_segment()?;
    assert_eq!(ack.flag, TcpFlag::ACK);
    assert_eq!(ack.seq_number, conn.engine_seq + 4);
    assert_eq!(ack.ack_number, conn.peer_seq);

    let acked = Connection {
        engine_seq: conn.engine_seq + 4,
        ..conn
    };
    harness.send_on(&acked, TcpFlag::ACK, &[])?;
    let response = harness.toe.send(conn.id, b"next")?;
    assert_eq!(response.error, SendError::None);
    assert_eq!(response.length, 4);
    expect_data(&harness, &conn, 4, b"next")?;
    harness.expect_no_segment()?;
    Ok(())
}

#[test]
#[serial]
fn test_nagle_segmentation() -> Result<()> {
    let harness = start(ToeConfig {
        tcp_nodelay: false,
        ..quiet_config()
    })?;
    let conn = harness.passive_open()?;
    let data = pattern(2 * MSS + 80);
    let response = harness.toe.send(conn.id, &data)?;
    assert_eq!(response.error, SendError::None);
    assert_eq!(response.length as usize, data.len());

    expect_data(&harness, &conn, 0, &data[..MSS])?;
    expect_data(&harness, &conn, MSS as u32, &data[MSS..2 * MSS])?;
    // The short tail waits while full segments are in flight.
    harness.expect_no_segment()?;

    let acked = Connection {
        engine_seq: conn.engine_seq + 2 * MSS as u32,
        ..conn
    };
    harness.send_on(&acked, TcpFlag::ACK, &[])?;
    expect_data(&harness, &conn, 2 * MSS as u32, &data[2 * MSS..])?;
    harness.expect_no_segment()?;
    Ok(())
}

#[test]
#[serial]
fn test_nagle_fin_follows_data() -> Result<()> {
    let harness = start(ToeConfig {
        tcp_nodelay: false,
        ..quiet_config()
    })?;
    let conn = harness.passive_open()?;
    let data = pattern(MSS + 10);
    harness.toe.send(conn.id, &data)?;
    expect_data(&harness, &conn, 0, &data[..MSS])?;
    harness.toe.close(conn.id)?;
    harness.expect_no_segment()?;

    let acked = Connection {
        engine_seq: conn.engine_seq + MSS as u32,
        ..conn
    };
    harness.send_on(&acked, TcpFlag::ACK, &[])?;
    expect_data(&harness, &conn, MSS as u32, &data[MSS..])?;
    let fin = harness.expect_segment()?;
    assert_eq!(fin.flag, TcpFlag::FIN | TcpFlag::ACK);
    assert_eq!(fin.seq_number, conn.engine_seq + data.len() as u32);
    Ok(())
}
