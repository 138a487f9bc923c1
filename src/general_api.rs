use crate::{Args, Result, http_server, socks_server};
use std::{
    net::Ipv4Addr,
    os::raw::{c_char, c_int},
};
use tokio::{net::TcpListener, task::JoinSet};
use tokio_util::sync::CancellationToken;

/// Address given to a tun interface created by name.
pub const TUN_IPV4: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
pub const TUN_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

static TUN_QUIT: std::sync::Mutex<Option<CancellationToken>> = std::sync::Mutex::new(None);

/// # Safety
///
/// Run tunrelay with command line arguments, blocking until it is stopped.
/// Parameters:
/// - cli_args: The command line arguments,
///   e.g. `tunrelay-bin --socks5-listen 0.0.0.0:1080 --tun-fd 42 --proxy socks5://192.168.49.1:1080`
///
/// `cli_args` must point to a valid NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tunrelay_run_with_cli_args(cli_args: *const c_char) -> c_int {
    let Ok(cli_args) = unsafe { std::ffi::CStr::from_ptr(cli_args) }.to_str() else {
        return -5;
    };
    let args = match <Args as ::clap::Parser>::try_parse_from(cli_args.split_whitespace()) {
        Ok(args) => args,
        Err(err) => {
            log::error!("invalid arguments: {err}");
            return -5;
        }
    };
    general_run_for_api(args)
}

pub fn general_run_for_api(args: Args) -> c_int {
    if let Err(err) = env_logger::Builder::new().filter_level(args.verbosity.into()).try_init() {
        log::debug!("set logger error: {}", err);
    }

    let shutdown_token = CancellationToken::new();
    if let Ok(mut lock) = TUN_QUIT.lock() {
        if lock.is_some() {
            log::error!("tunrelay already started");
            return -1;
        }
        *lock = Some(shutdown_token.clone());
    } else {
        log::error!("failed to lock tunrelay quit token");
        return -2;
    }

    let Ok(rt) = tokio::runtime::Builder::new_multi_thread().enable_all().build() else {
        log::error!("failed to create tokio runtime");
        tunrelay_stop_internal();
        return -3;
    };
    let res = rt.block_on(general_run_async(args, shutdown_token));
    tunrelay_stop_internal();
    match res {
        Ok(()) => 0,
        Err(err) => {
            log::error!("failed to run tunrelay with error: {:?}", err);
            -4
        }
    }
}

/// Runs every configured service until `shutdown_token` fires.
///
/// A service failing cancels the others; the first error is returned.
pub async fn general_run_async(args: Args, shutdown_token: CancellationToken) -> Result<()> {
    let config = args.server_config();
    let mut services = JoinSet::new();

    if let Some(addr) = args.socks5_listen {
        let listener = TcpListener::bind(addr).await?;
        services.spawn(socks_server::run(listener, config.clone(), shutdown_token.clone()));
    }
    if let Some(addr) = args.http_listen {
        let listener = TcpListener::bind(addr).await?;
        services.spawn(http_server::run(listener, config.clone(), shutdown_token.clone()));
    }
    if args.engine_enabled() {
        let device = open_tun(&args)?;
        let mtu = args.mtu;
        let shutdown_token = shutdown_token.clone();
        services.spawn(async move { crate::run(device, mtu, args, shutdown_token).await.map_err(std::io::Error::from) });
    }

    let mut result = Ok(());
    while let Some(res) = services.join_next().await {
        let res = res.map_err(std::io::Error::from).and_then(|res| res);
        if let Err(err) = res {
            log::error!("service failed: {err}");
            shutdown_token.cancel();
            if result.is_ok() {
                result = Err(err.into());
            }
        }
    }
    result
}

fn open_tun(args: &Args) -> std::io::Result<tun::AsyncDevice> {
    let mut tun_config = tun::Configuration::default();
    tun_config.mtu(args.mtu).up();

    #[cfg(unix)]
    if let Some(fd) = args.tun_fd {
        tun_config.raw_fd(fd);
    } else {
        tun_config.address(TUN_IPV4).netmask(TUN_NETMASK);
        if let Some(ref tun) = args.tun {
            tun_config.tun_name(tun);
        }
    }
    #[cfg(not(unix))]
    {
        tun_config.address(TUN_IPV4).netmask(TUN_NETMASK);
        if let Some(ref tun) = args.tun {
            tun_config.tun_name(tun);
        }
    }

    let device = tun::create_as_async(&tun_config)?;
    log::info!("tun device ready, mtu {}", args.mtu);
    Ok(device)
}

/// Stop a running tunrelay started through [`tunrelay_run_with_cli_args`].
#[unsafe(no_mangle)]
pub extern "C" fn tunrelay_stop() -> c_int {
    tunrelay_stop_internal()
}

pub(crate) fn tunrelay_stop_internal() -> c_int {
    if let Ok(mut lock) = TUN_QUIT.lock() {
        if let Some(shutdown_token) = lock.take() {
            shutdown_token.cancel();
            return 0;
        }
    }
    -1
}
