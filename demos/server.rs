use anyhow::{bail, Result};
use tokio_dbus_next::org_freedesktop_dbus::{NameFlag, NameReply};
use tokio_dbus_next::service::{MethodDef, ServiceInterface};
use tokio_dbus_next::MessageBus;

const NAME: &str = "se.tedro.DBusExample";
const INTERFACE: &str = "se.tedro.DBusExample.Pingable";
const PATH: &str = "/se/tedro/DBusExample";

#[tokio::main]
async fn main() -> Result<()> {
    let bus = MessageBus::session_bus()?;

    let pingable = ServiceInterface::builder(INTERFACE)
        .method(MethodDef::new("Ping", "u", "u", |body| Ok(body.to_vec())))
        .build()?;

    bus.export(PATH, &pingable)?;
    bus.connect().await?;

    let reply = bus.request_name(NAME, NameFlag::DO_NOT_QUEUE).await?;

    match reply {
        NameReply::PRIMARY_OWNER => {}
        reply => {
            bail!("Could not acquire name: {reply:?}");
        }
    }

    bus.wait_for_disconnect().await;
    Ok(())
}
