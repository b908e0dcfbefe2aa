//! Integration tests driving the shared transport against an in-process
//! TCP gateway.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use buslink::{
    BusTransport, BusTransportConfig, Command, Dispatcher, Frame, FrameHandler, RoutingKey,
    RoutingMode, SWITCH_REGISTER,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

struct Collector {
    frames: Mutex<Vec<Frame>>,
}

#[async_trait]
impl FrameHandler for Collector {
    async fn on_frame(&self, frame: &Frame) {
        self.frames.lock().await.push(frame.clone());
    }
}

async fn gateway() -> (TcpListener, BusTransportConfig) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = BusTransportConfig {
        host: "127.0.0.1".to_string(),
        port,
        connect_timeout: Duration::from_secs(2),
        initial_retry_delay: Duration::from_millis(50),
        max_retry_delay: Duration::from_millis(200),
    };
    (listener, config)
}

async fn accept(listener: &TcpListener) -> TcpStream {
    let (socket, _) = tokio::time::timeout(Duration::from_secs(2), listener.accept())
        .await
        .expect("gateway accept timed out")
        .unwrap();
    socket
}

#[tokio::test]
async fn frames_flow_from_gateway_to_subscriber_in_order() {
    let (listener, config) = gateway().await;
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    let transport = BusTransport::new(config, frames_tx).unwrap();
    let dispatcher = Arc::new(Dispatcher::new(transport.clone()));
    let cancel = CancellationToken::new();
    let dispatch_task = dispatcher.clone().spawn(frames_rx, cancel.clone());

    let collector = Arc::new(Collector {
        frames: Mutex::new(Vec::new()),
    });
    let handle = dispatcher
        .subscribe(
            "bank-5-1",
            RoutingKey {
                identify: 51,
                slave_id: 5,
            },
            RoutingMode::Bank,
            collector.clone(),
        )
        .await;

    let mut socket = accept(&listener).await;

    // Two records in one write: both must arrive, in socket order
    let mut bytes = Command::read_registers(5, 51, SWITCH_REGISTER, 1)
        .encode()
        .unwrap()
        .to_vec();
    bytes.extend_from_slice(
        &Command::write_register(5, 51, SWITCH_REGISTER, 0x0003)
            .encode()
            .unwrap(),
    );
    socket.write_all(&bytes).await.unwrap();

    for _ in 0..200 {
        if collector.frames.lock().await.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let frames = collector.frames.lock().await;
    assert_eq!(frames.len(), 2, "both frames delivered");
    assert_eq!(frames[0].function_code, 3);
    assert_eq!(frames[1].function_code, 6);
    drop(frames);

    // Last unsubscribe closes the socket: the gateway sees EOF
    dispatcher.unsubscribe(handle).await;
    assert!(!transport.is_connected());
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(2), socket.read(&mut buf))
        .await
        .expect("gateway read timed out")
        .unwrap();
    assert_eq!(n, 0, "socket closed after last unsubscribe");

    cancel.cancel();
    let _ = dispatch_task.await;
}

#[tokio::test]
async fn send_reaches_the_gateway() {
    let (listener, config) = gateway().await;
    let (frames_tx, _frames_rx) = mpsc::unbounded_channel();
    let transport = BusTransport::new(config, frames_tx).unwrap();

    transport.open().await;
    let mut socket = accept(&listener).await;

    for _ in 0..200 {
        if transport.is_connected() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(transport.is_connected());

    let command = Command::read_registers(5, 53, SWITCH_REGISTER, 1);
    transport.send_command(&command).await.unwrap();

    let expected = command.encode().unwrap();
    let mut buf = vec![0u8; expected.len()];
    tokio::time::timeout(Duration::from_secs(2), socket.read_exact(&mut buf))
        .await
        .expect("gateway read timed out")
        .unwrap();
    assert_eq!(buf, expected.to_vec());
    assert!(transport.stats().bytes_sent >= expected.len() as u64);

    transport.close().await;
}

#[tokio::test]
async fn transport_reconnects_while_subscribed() {
    let (listener, config) = gateway().await;
    let (frames_tx, _frames_rx) = mpsc::unbounded_channel();
    let transport = BusTransport::new(config, frames_tx).unwrap();

    transport.open().await;
    let socket = accept(&listener).await;
    for _ in 0..200 {
        if transport.is_connected() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(transport.is_connected());

    // Gateway drops the connection; the transport must come back on its own
    drop(socket);
    let _socket = accept(&listener).await;
    for _ in 0..200 {
        if transport.is_connected() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(transport.is_connected(), "reconnected after gateway drop");
    assert!(transport.stats().successful_connections >= 2);

    transport.close().await;
}
