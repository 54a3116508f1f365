//! Full-stack sessions against a scripted adapter: bus initialisation,
//! one J1979 exchange and teardown, per protocol family.

use kline_diagnostics::hardware::simulation::SimulationDevice;
use kline_diagnostics::hardware::L0Flags;
use kline_diagnostics::l2::{ConnectionConfig, InitMode, L2Connection, ProtocolKind};
use kline_diagnostics::l3::j1979::{decode_message, J1979Session, TESTER_ADDR};
use kline_diagnostics::message::DiagMessage;

/// Mode 1 PID 0 request as a J1979 payload
const MODE1_PID0: [u8; 2] = [0x01, 0x00];

#[test]
fn iso9141_five_baud_session() {
    let dev = SimulationDevice::new(L0Flags::DOES_P4_WAIT);
    // Key bytes, then the inverted address echo completing the handshake
    dev.queue_bytes(&[0x08]);
    dev.queue_bytes(&[0x08]);
    dev.queue_bytes(&[0xCC]);
    // Mode 1 PID 0 response, ISO9141 framed
    dev.queue_bytes(&[0x48, 0x6B, 0x10, 0x41, 0x00, 0xBE, 0x1F, 0xB8, 0x10, 0xA9]);

    let mut conn = L2Connection::start_comms(
        Box::new(dev.clone()),
        ProtocolKind::Iso9141,
        &ConnectionConfig::default(),
    )
    .unwrap();
    assert_eq!(conn.key_bytes(), (0x08, 0x08));

    let mut session = J1979Session::new(TESTER_ADDR);
    let resp = session
        .request(&mut conn, &DiagMessage::new(TESTER_ADDR, 0x33, &MODE1_PID0), 100)
        .unwrap();

    assert_eq!(resp.src, 0x10);
    assert_eq!(resp.data, vec![0x41, 0x00, 0xBE, 0x1F, 0xB8, 0x10]);
    assert_eq!(
        dev.last_tx().as_deref(),
        Some(&[0x68, 0x6A, 0xF1, 0x01, 0x00, 0xC4][..])
    );
}

#[test]
fn kwp2000_fast_init_session() {
    let dev = SimulationDevice::new(L0Flags::FAST | L0Flags::DOES_P4_WAIT);
    // StartCommunication positive response with the key bytes
    dev.queue_bytes(&[0x83, 0xF1, 0x11, 0xC1, 0xE9, 0x8F, 0xBE]);
    // Mode 1 response from ECU 0x11
    dev.queue_bytes(&[0x83, 0xF1, 0x11, 0x41, 0x0D, 0x3C, 0x0F]);

    let mut conn = L2Connection::start_comms(
        Box::new(dev.clone()),
        ProtocolKind::Iso14230,
        &ConnectionConfig {
            init: InitMode::Fast,
            ..ConnectionConfig::default()
        },
    )
    .unwrap();
    assert_eq!(conn.key_bytes(), (0xE9, 0x8F));

    let mut session = J1979Session::new(TESTER_ADDR);
    let resp = session
        .request(&mut conn, &DiagMessage::new(TESTER_ADDR, 0x33, &MODE1_PID0), 100)
        .unwrap();
    assert_eq!(resp.src, 0x11);
    assert_eq!(resp.data, vec![0x41, 0x0D, 0x3C]);

    conn.stop_comms().unwrap();
    // StopCommunication went out on teardown
    assert_eq!(
        dev.last_tx().as_deref(),
        Some(&[0x81, 0x33, 0xF1, 0x82, 0x27][..])
    );
}

#[test]
fn j1850_vpw_session_rides_out_contention() {
    let dev = SimulationDevice::new(L0Flags::DOES_L2_FRAME | L0Flags::DOES_P4_WAIT);
    dev.queue_error(kline_diagnostics::DiagError::BusError);
    dev.queue_bytes(&[0x48, 0x6B, 0x10, 0x41, 0x00, 0xBE, 0x1F, 0xB8, 0x62]);

    let mut conn = L2Connection::start_comms(
        Box::new(dev.clone()),
        ProtocolKind::SaeJ1850Vpw,
        &ConnectionConfig::default(),
    )
    .unwrap();

    let mut session = J1979Session::new(TESTER_ADDR);
    let resp = session
        .request(&mut conn, &DiagMessage::new(TESTER_ADDR, 0x33, &MODE1_PID0), 100)
        .unwrap();
    assert_eq!(resp.src, 0x10);
    assert_eq!(resp.data, vec![0x41, 0x00, 0xBE, 0x1F, 0xB8]);

    // The arbitration loss forced one resend of the request frame
    let tx = dev.tx();
    assert_eq!(tx.len(), 2);
    assert_eq!(tx[0], tx[1]);
    assert_eq!(tx[0], vec![0x68, 0x33, 0xF1, 0x01, 0x00, 0xA7]);
}

#[test]
fn mode3_dtc_report_decodes() {
    let dev = SimulationDevice::new(L0Flags::DOES_P4_WAIT);
    dev.queue_bytes(&[0x08]);
    dev.queue_bytes(&[0x08]);
    dev.queue_bytes(&[0xCC]);
    // Two stored DTCs, third slot empty
    let mut frame = vec![0x48, 0x6B, 0x10, 0x43, 0x01, 0x43, 0x01, 0x96, 0x00, 0x00];
    frame.push(frame.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)));
    dev.queue_bytes(&frame);

    let mut conn = L2Connection::start_comms(
        Box::new(dev.clone()),
        ProtocolKind::Iso9141,
        &ConnectionConfig::default(),
    )
    .unwrap();

    let mut session = J1979Session::new(TESTER_ADDR);
    let resp = session
        .request(&mut conn, &DiagMessage::new(TESTER_ADDR, 0x33, &[0x03]), 100)
        .unwrap();

    let rendered = decode_message(&resp.data);
    assert!(rendered.contains("P0143"), "{rendered}");
    assert!(rendered.contains("P0196"), "{rendered}");
}
