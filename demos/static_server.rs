mod utils;

use anyhow::Error;
use keel_http::{Server, ServerConfig};
use tracing::{event, Level};

fn main() -> Result<(), Error> {
    utils::init_logging()?;

    // Serve the bundled resources unless told otherwise
    let mut config = ServerConfig::load()?;
    if std::env::var_os("KEEL_ROOT").is_none() {
        config.root = concat!(env!("CARGO_MANIFEST_DIR"), "/resources").into();
    }

    let server = Server::bind(config)?;
    event!(Level::INFO, addr = %server.local_addr()?, "serving files");

    server.run()?;

    Ok(())
}
