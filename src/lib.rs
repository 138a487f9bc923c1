use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

pub use {
    args::{ArgProxy, ArgVerbosity, Args, DEFAULT_PROXY_URL, ProxyType},
    error::{BoxError, Error, Result},
    general_api::{general_run_async, general_run_for_api, tunrelay_run_with_cli_args, tunrelay_stop},
    proxy_handler::{ProxyConnector, create_connector},
    target::ProxyTarget,
};

mod args;
mod error;
pub mod flow_table;
mod general_api;
mod http;
pub mod http_server;
pub mod packet;
mod proxy_handler;
pub mod relay;
pub mod server;
mod socks;
pub mod socks5;
pub mod socks_server;
pub mod target;
pub mod tun2socks;
pub mod virtdevice;

pub use http::HttpConnector;
pub use socks::SocksConnector;

/// Runs the tun engine on `device` with the upstream proxy from `args` until the device
/// closes or `shutdown_token` is cancelled.
pub async fn run<D>(device: D, mtu: u16, args: Args, shutdown_token: CancellationToken) -> Result<()>
where
    D: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut config = args.engine_config();
    config.mtu = mtu;
    log::info!("Proxy {} server: {}", args.proxy.proxy_type, args.proxy.addr);
    let connector = create_connector(&args.proxy, config.connect_timeout);
    tun2socks::Engine::new(connector, config).run(device, shutdown_token).await
}
