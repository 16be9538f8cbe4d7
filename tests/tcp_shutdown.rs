mod common;
use anyhow::Result;
use common::{fast_config, quiet_config, start, Connection, Harness, PEER_ADDR};
use serial_test::serial;
use std::net::SocketAddrV4;
use toe_r::tcp::{
    defs::SessionState,
    packet::{TcpFlag, TcpPacket},
};

fn expect_fin(harness: &Harness, conn: &Connection) -> Result<TcpPacket> {
    let fin = harness.expect_segment()?;
    anyhow::ensure!(
        fin.flag == TcpFlag::FIN | TcpFlag::ACK,
        "Expected FIN, got {:?}.",
        fin.flag
    );
    anyhow::ensure!(fin.seq_number == conn.engine_seq, "Wrong FIN sequence number.");
    Ok(fin)
}

fn expect_ack(harness: &Harness, seq: u32, ack: u32) -> Result<()> {
    let segment = harness.expect_segment()?;
    anyhow::ensure!(segment.flag == TcpFlag::ACK, "Expected ACK, got {:?}.", segment.flag);
    anyhow::ensure!(
        segment.seq_number == seq && segment.ack_number == ack,
        "ACK is <SEQ={}><ACK={}> instead of <SEQ={}><ACK={}>.",
        segment.seq_number,
        segment.ack_number,
        seq,
        ack
    );
    Ok(())
}

#[test]
#[serial]
fn test_active_close() -> Result<()> {
    let harness = start(quiet_config())?;
    let mut conn = harness.passive_open()?;
    harness.toe.close(conn.id)?;
    let fin = expect_fin(&harness, &conn)?;
    assert_eq!(fin.ack_number, conn.peer_seq);
    assert_eq!(harness.toe.session_state(conn.id)?, SessionState::FinWait1);

    conn.engine_seq += 1;
    harness.send_on(&conn, TcpFlag::ACK, &[])?;
    harness.wait_state(conn.id, SessionState::FinWait2)?;

    harness.send_on(&conn, TcpFlag::FIN | TcpFlag::ACK, &[])?;
    expect_ack(&harness, conn.engine_seq, conn.peer_seq + 1)?;
    // TIME-WAIT runs out by itself.
    harness.wait_state(conn.id, SessionState::Closed)?;
    let stats = harness.wait_stats(|s| s.tcp_curr_estab == 0)?;
    assert_eq!(stats.tcp_estab_resets, 0);
    harness.expect_no_segment()?;
    Ok(())
}

#[test]
#[serial]
fn test_passive_close() -> Result<()> {
    let harness = start(quiet_config())?;
    let mut conn = harness.passive_open()?;
    harness.send_on(&conn, TcpFlag::FIN | TcpFlag::ACK, &[])?;
    conn.peer_seq += 1;
    let fin = expect_fin(&harness, &conn)?;
    assert_eq!(fin.ack_number, conn.peer_seq);
    assert_eq!(harness.toe.session_state(conn.id)?, SessionState::LastAck);
    // The FIN is not data.
    assert!(harness.toe.read(conn.id, 100)?.is_empty());

    conn.engine_seq += 1;
    harness.send_on(&conn, TcpFlag::ACK, &[])?;
    let closed = harness.expect_notification(|n| n.closed)?;
    assert_eq!(closed.session_id, conn.id);
    assert_eq!(closed.remote_addr, SocketAddrV4::new(PEER_ADDR, conn.peer_port));
    harness.wait_state(conn.id, SessionState::Closed)?;
    harness.wait_stats(|s| s.tcp_curr_estab == 0)?;
    Ok(())
}

#[test]
#[serial]
fn test_fin_with_payload() -> Result<()> {
    let harness = start(quiet_config())?;
    let conn = harness.passive_open()?;
    harness.send_on(&conn, TcpFlag::FIN | TcpFlag::ACK | TcpFlag::PSH, b"bye")?;
    let notification = harness.expect_notification(|n| n.length > 0)?;
    assert_eq!(notification.length, 3);
    let fin = expect_fin(&harness, &conn)?;
    assert_eq!(fin.ack_number, conn.peer_seq + 4);
    assert_eq!(harness.toe.read(conn.id, 100)?, b"bye");
    assert!(harness.toe.read(conn.id, 100)?.is_empty());
    Ok(())
}

#[test]
#[serial]
fn test_simultaneous_close() -> Result<()> {
    let harness = start(quiet_config())?;
    let mut conn = harness.passive_open()?;
    harness.toe.close(conn.id)?;
    expect_fin(&harness, &conn)?;

    // The peer's FIN crosses ours and does not acknowledge it yet.
    harness.send_on(&conn, TcpFlag::FIN | TcpFlag::ACK, &[])?;
    conn.peer_seq += 1;
    expect_ack(&harness, conn.engine_seq + 1, conn.peer_seq)?;
    harness.wait_state(conn.id, SessionState::Closing)?;

    conn.engine_seq += 1;
    harness.send_on(&conn, TcpFlag::ACK, &[])?;
    harness.wait_state(conn.id, SessionState::Closed)?;
    harness.wait_stats(|s| s.tcp_curr_estab == 0)?;
    Ok(())
}

#[test]
#[serial]
fn test_close_twice_sends_one_fin() -> Result<()> {
    let harness = start(quiet_config())?;
    let conn = harness.passive_open()?;
    harness.toe.close(conn.id)?;
    expect_fin(&harness, &conn)?;
    harness.toe.close(conn.id)?;
    harness.expect_no_segment()?;
    assert_eq!(harness.toe.session_state(conn.id)?, SessionState::FinWait1);
    Ok(())
}

#[test]
#[serial]
fn test_fin_retransmission() -> Result<()> {
    let harness = start(fast_config())?;
    let conn = harness.passive_open()?;
    harness.toe.close(conn.id)?;
    expect_fin(&harness, &conn)?;
    let again = expect_fin(&harness, &conn)?;
    assert_eq!(again.ack_number, conn.peer_seq);
    harness.wait_stats(|s| s.tcp_retrans_segs >= 1)?;
    Ok(())
}

#[test]
#[serial]
fn test_reset_closes_established() -> Result<()> {
    let harness = start(quiet_config())?;
    let conn = harness.passive_open()?;
    harness.send_on(&conn, TcpFlag::RST, &[])?;
    let closed = harness.expect_notification(|n| n.closed)?;
    assert_eq!(closed.session_id, conn.id);
    harness.wait_state(conn.id, SessionState::Closed)?;
    let stats = harness.wait_stats(|s| s.tcp_curr_estab == 0)?;
    assert_eq!(stats.tcp_estab_resets, 1);
    assert_eq!(stats.tcp_attempt_fails, 0);
    harness.expect_no_segment()?;
    Ok(())
}

#[test]
#[serial]
fn test_reset_outside_window_is_ignored() -> Result<()> {
    let harness = start(quiet_config())?;
    let conn = harness.passive_open()?;
    let stray = Connection {
        peer_seq: conn.peer_seq + 10,
        ..conn
    };
    harness.send_on(&stray, TcpFlag::RST, &[])?;
    harness.expect_no_notification()?;
    assert_eq!(harness.toe.session_state(conn.id)?, SessionState::Established);
    assert_eq!(harness.toe.stats().tcp_estab_resets, 0);
    Ok(())
}

#[test]
#[serial]
fn test_close_before_established_is_ignored() -> Result<()> {
    let harness = start(quiet_config())?;
    let id = harness.toe.open(SocketAddrV4::new(PEER_ADDR, 7))?;
    let syn = harness.expect_segment()?;
    assert_eq!(syn.flag, TcpFlag::SYN);
    harness.toe.close(id)?;
    harness.expect_no_segment()?;
    assert_eq!(harness.toe.session_state(id)?, SessionState::SynSent);
    Ok(())
}

#[test]
#[serial]
fn test_sessions_get_distinct_ports() -> Result<()> {
    let harness = start(quiet_config())?;
    let first = harness.toe.open(SocketAddrV4::new(PEER_ADDR, 7))?;
    let first_syn = harness.expect_segment()?;
    let second = harness.toe.open(SocketAddrV4::new(PEER_ADDR, 7))?;
    let second_syn = harness.expect_segment()?;
    assert_ne!(first, second);
    assert_ne!(first_syn.src_port, second_syn.src_port);
    harness.wait_stats(|s| s.tcp_curr_estab == 2 && s.tcp_active_opens == 2)?;
    Ok(())
}
