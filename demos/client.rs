use anyhow::{bail, Result};
use tokio_dbus_next::{Message, MessageBus, Value};

const NAME: &str = "se.tedro.DBusExample";
const INTERFACE: &str = "se.tedro.DBusExample.Pingable";
const PATH: &str = "/se/tedro/DBusExample";

#[tokio::main]
async fn main() -> Result<()> {
    let bus = MessageBus::session_bus()?;
    bus.connect().await?;

    let m = Message::method_call(PATH, "Ping")?
        .with_destination(NAME)?
        .with_interface(INTERFACE)?
        .with_body("u", vec![Value::Uint32(42)])?;

    let Some(reply) = bus.call(m).await? else {
        bail!("Expected a reply");
    };

    if let Some(error_name) = reply.error_name() {
        bail!("Error: {error_name}");
    }

    dbg!(reply.body());
    bus.disconnect();
    Ok(())
}
