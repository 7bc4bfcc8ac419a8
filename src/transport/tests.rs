use bytes::Bytes;
use pretty_assertions::assert_eq;
use tokio_test::io::Builder;

use super::*;

#[tokio::test]
async fn reads_one_frame_per_line() {
    let stream = Builder::new()
        .read(b"{\"type\":\"subscribe\",\"topic\":\"news\"}\n")
        .build();
    let mut transport = TcpTransport::new(stream, 1024);

    let frame = transport.recv().await.unwrap().unwrap();
    assert_eq!(
        frame,
        Bytes::from_static(b"{\"type\":\"subscribe\",\"topic\":\"news\"}")
    );
    assert!(transport.recv().await.unwrap().is_none());
}

#[tokio::test]
async fn splits_lines_batched_into_one_read() {
    let stream = Builder::new().read(b"one\ntwo\nthree\n").build();
    let mut transport = TcpTransport::new(stream, 1024);

    assert_eq!(transport.recv().await.unwrap().unwrap(), "one");
    assert_eq!(transport.recv().await.unwrap().unwrap(), "two");
    assert_eq!(transport.recv().await.unwrap().unwrap(), "three");
    assert!(transport.recv().await.unwrap().is_none());
}

#[tokio::test]
async fn reassembles_a_line_split_across_reads() {
    let stream = Builder::new()
        .read(b"first ha")
        .read(b"lf\nsecond")
        .read(b" half\n")
        .build();
    let mut transport = TcpTransport::new(stream, 1024);

    assert_eq!(transport.recv().await.unwrap().unwrap(), "first half");
    assert_eq!(transport.recv().await.unwrap().unwrap(), "second half");
}

#[tokio::test]
async fn strips_carriage_returns() {
    let stream = Builder::new().read(b"crlf line\r\n").build();
    let mut transport = TcpTransport::new(stream, 1024);

    assert_eq!(transport.recv().await.unwrap().unwrap(), "crlf line");
}

#[tokio::test]
async fn skips_blank_lines() {
    let stream = Builder::new().read(b"\n\r\nreal\n").build();
    let mut transport = TcpTransport::new(stream, 1024);

    assert_eq!(transport.recv().await.unwrap().unwrap(), "real");
    assert!(transport.recv().await.unwrap().is_none());
}

#[tokio::test]
async fn eof_mid_line_is_a_clean_close() {
    let stream = Builder::new().read(b"partial without newline").build();
    let mut transport = TcpTransport::new(stream, 1024);

    assert!(transport.recv().await.unwrap().is_none());
}

#[tokio::test]
async fn oversized_line_is_rejected() {
    let stream = Builder::new().read(b"0123456789abcdef").build();
    let mut transport = TcpTransport::new(stream, 8);

    let err = transport.recv().await.unwrap_err();
    assert!(matches!(
        err,
        TransportError::FrameTooLarge { size: 16, limit: 8 }
    ));
}

#[tokio::test]
async fn send_appends_the_delimiter() {
    let stream = Builder::new().write(b"hello\n").build();
    let mut transport = TcpTransport::new(stream, 1024);

    transport.send(Bytes::from_static(b"hello")).await.unwrap();
    transport.close().await.unwrap();
}
