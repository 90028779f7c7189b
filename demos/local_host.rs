//! Example: a host running a server and its own client in one process
//!
//! The client greets the server, the server echoes the greeting back, and the
//! client asks the server to add two numbers through a request.
//!
//! Run with: `cargo run --example local_host`
//! Set `TICKWIRE_LOG=debug` to see the handshake.

use std::sync::Arc;
use std::time::Duration;

use tickwire::config::NetworkConfig;
use tickwire::core::Bincoded;
use tickwire::protocol::handshake::AcceptAllAuthenticator;
use tickwire::protocol::request::Response;
use tickwire::service::manager::NetManager;
use tickwire::transport::local::LocalNetwork;
use tickwire::transport::DeliveryMethod;
use tickwire::utils::logging::init_logging;

const GREETING: u16 = 1;
const ECHO: u16 = 2;
const ADD: u16 = 10;

const FRAME: Duration = Duration::from_millis(16);

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = NetworkConfig::default();
    init_logging(&config.logging);

    let network = LocalNetwork::new();
    let mut manager = NetManager::new(
        config,
        Arc::new(AcceptAllAuthenticator),
        Box::new(network.endpoint()),
        Box::new(network.endpoint()),
    )?;

    let dispatcher = Arc::clone(manager.dispatcher());
    dispatcher.register_server_payload_handler(GREETING, |ctx, conn_id, reader| {
        let text = reader.get_string()?.unwrap_or_default();
        println!("server <- {conn_id}: {text}");
        ctx.send(conn_id, ECHO, DeliveryMethod::Reliable, &Some(text))
    })?;
    dispatcher.register_client_payload_handler(ECHO, |_, reader| {
        println!("client <- echo: {:?}", reader.get_string()?);
        Ok(())
    })?;
    dispatcher.register_request_handler(ADD, |_, Bincoded((a, b)): Bincoded<(i32, i32)>| {
        Ok(a + b)
    })?;
    manager.register_response_handler::<Bincoded<(i32, i32)>, i32>(ADD)?;

    manager.start_host()?;
    while !manager.client().is_authenticated() {
        manager.tick(FRAME);
    }
    println!("client authenticated as connection {}", manager.client().context().conn_id());

    let client = manager.client_mut().context_mut();
    client.send(GREETING, DeliveryMethod::Reliable, &Some(String::from("hello")))?;
    client.send_request(ADD, &Bincoded((20, 22)), |response: Response<i32>| {
        println!("client <- add: {:?} {:?}", response.status, response.body);
    })?;

    for _ in 0..4 {
        manager.tick(FRAME);
    }

    manager.shutdown();
    Ok(())
}
