//! Full conversations over the TCP and in-process transports.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tether::{
    endpoints, AcceptHandler, ChannelAcceptor, ChannelConnector, Provider, RemoteError,
    TcpAcceptor, TcpConnector, TcpServer, TcpServerHandle, TetherError,
};
use tokio::sync::Notify;

tether::driver! {
    /// Client side of the calculator.
    pub struct CalculatorDriver {
        fn plus(x: f64, y: f64) -> f64;
        fn divide(x: f64, y: f64) -> f64;
        fn fail_with_type_error() -> ();
        object nested: NestedDriver;
    }
}

tether::driver! {
    pub struct NestedDriver {
        fn double(x: f64) -> f64;
    }
}

tether::driver! {
    pub struct GreeterDriver {
        fn greet(name: String) -> String;
    }
}

fn calculator() -> Provider {
    Provider::new()
        .sync_method("plus", |(x, y): (f64, f64)| Ok(x + y))
        .sync_method("divide", |(x, y): (f64, f64)| {
            if y == 0.0 {
                Err(RemoteError::error("Divided by zero."))
            } else {
                Ok(x / y)
            }
        })
        .sync_method("fail_with_type_error", |(): ()| -> Result<(), RemoteError> {
            Err(RemoteError::type_error("x"))
        })
        .object(
            "nested",
            Provider::new().sync_method("double", |(x,): (f64,)| Ok(x * 2.0)),
        )
}

struct CalculatorHandler;

#[async_trait::async_trait]
impl AcceptHandler<String> for CalculatorHandler {
    async fn on_connection(&self, acceptor: TcpAcceptor<String>) {
        acceptor.accept(calculator()).await.unwrap();
    }
}

async fn tcp_calculator() -> (TcpServerHandle, TcpConnector<String>) {
    let server = TcpServer::open("127.0.0.1:0", Arc::new(CalculatorHandler))
        .await
        .unwrap();
    let connector = TcpConnector::new("guest".to_string(), None::<Provider>);
    connector.connect(server.addr()).await.unwrap();
    (server, connector)
}

#[tokio::test]
async fn test_calculator_over_tcp() {
    let (_server, connector) = tcp_calculator().await;
    let calculator: CalculatorDriver = connector.driver_as();

    assert_eq!(calculator.plus(2.0, 3.0).await.unwrap(), 5.0);
    assert_eq!(calculator.nested().double(21.0).await.unwrap(), 42.0);

    let err = calculator.divide(1.0, 0.0).await.unwrap_err();
    let remote = err.as_remote().unwrap();
    assert_eq!(remote.message, "Divided by zero.");

    connector.close().await.unwrap();
}

#[tokio::test]
async fn test_type_error_round_trip() {
    let (_server, connector) = tcp_calculator().await;
    let calculator: CalculatorDriver = connector.driver_as();

    let err = calculator.fail_with_type_error().await.unwrap_err();
    let remote = err.as_remote().unwrap();
    assert_eq!(remote.name, "TypeError");
    assert_eq!(remote.message, "x");
}

#[tokio::test]
async fn test_security_guards_over_the_wire() {
    let (_server, connector) = tcp_calculator().await;
    let driver = connector.driver();

    for path in ["_secret", "secret_", "constructor", "plus.prototype", "toString"] {
        let member = path
            .split('.')
            .fold(driver.clone(), |proxy, segment| proxy.member(segment));
        let err = member.call(vec![]).await.unwrap_err();
        assert_eq!(
            err.as_remote().map(|e| e.name.as_str()),
            Some("SecurityError"),
            "{} should be refused",
            path
        );
    }
}

#[tokio::test]
async fn test_non_finite_argument_is_refused_remotely() {
    let (_server, connector) = tcp_calculator().await;
    let calculator: CalculatorDriver = connector.driver_as();

    // NaN has no JSON form and arrives as null.
    let err = calculator.plus(1.0, f64::NAN).await.unwrap_err();
    assert_eq!(err.as_remote().unwrap().name, "TypeError");
}

struct GreetingServer;

#[async_trait::async_trait]
impl AcceptHandler<String> for GreetingServer {
    async fn on_connection(&self, acceptor: TcpAcceptor<String>) {
        let greeter: GreeterDriver = acceptor.driver_as();
        let name = acceptor.header().clone();
        let provider = Provider::new().method("welcome", move |(): ()| {
            let greeter = greeter.clone();
            let name = name.clone();
            async move { greeter.greet(name).await.map_err(RemoteError::from) }
        });
        acceptor.accept(provider).await.unwrap();
    }
}

#[tokio::test]
async fn test_calls_flow_both_ways() {
    let server = TcpServer::open("127.0.0.1:0", Arc::new(GreetingServer))
        .await
        .unwrap();

    let provider = Provider::new().sync_method("greet", |(name,): (String,)| {
        Ok(format!("hello, {}", name))
    });
    let connector = TcpConnector::new("ada".to_string(), provider);
    connector.connect(server.addr()).await.unwrap();

    let reply = connector.driver().invoke("welcome", vec![]).await.unwrap();
    assert_eq!(reply, json!("hello, ada"));
}

#[tokio::test]
async fn test_slow_call_does_not_block_others() {
    let (client_port, server_port) = endpoints::<()>();
    let release = Arc::new(Notify::new());

    let gate = release.clone();
    let provider = calculator().method("wait", move |(): ()| {
        let gate = gate.clone();
        async move {
            gate.notified().await;
            Ok::<_, RemoteError>("released")
        }
    });

    let server = tokio::spawn(async move {
        let acceptor = ChannelAcceptor::handshake(server_port).await.unwrap();
        acceptor.accept(provider).await.unwrap();
        acceptor
    });
    let connector = ChannelConnector::new((), None::<Provider>);
    connector.connect(client_port).await.unwrap();
    let _acceptor = server.await.unwrap();

    let driver = connector.driver();
    let slow = {
        let driver = driver.clone();
        tokio::spawn(async move { driver.invoke("wait", vec![]).await })
    };

    let calculator: CalculatorDriver = connector.driver_as();
    assert_eq!(calculator.plus(20.0, 22.0).await.unwrap(), 42.0);
    assert!(!slow.is_finished());

    release.notify_one();
    let value = tokio::time::timeout(Duration::from_secs(5), slow)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(value, json!("released"));
}

#[tokio::test]
async fn test_pending_call_rejected_once_on_disconnect() {
    let (client_port, server_port) = endpoints::<()>();
    let provider = Provider::new().method("hang", |(): ()| async {
        std::future::pending::<Result<(), RemoteError>>().await
    });

    let server = tokio::spawn(async move {
        let acceptor = ChannelAcceptor::handshake(server_port).await.unwrap();
        acceptor.accept(provider).await.unwrap();
        acceptor
    });
    let connector = ChannelConnector::new((), None::<Provider>);
    connector.connect(client_port).await.unwrap();
    let acceptor = server.await.unwrap();

    let call = {
        let driver = connector.driver();
        tokio::spawn(async move { driver.invoke("hang", vec![]).await })
    };
    while connector.communicator().pending_count() == 0 {
        tokio::task::yield_now().await;
    }

    acceptor.close().await.unwrap();

    let err = tokio::time::timeout(Duration::from_secs(5), call)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, TetherError::Disconnected { .. }));
    assert_eq!(connector.communicator().pending_count(), 0);
    connector.join().await.unwrap();
}
