//! NTRIP Caster 服务器入口

use std::net::SocketAddr;

use clap::Parser;
use ntrip_relay::{config, init_tracing, start_server};
use tracing::info;

/// NTRIP Caster 服务器配置参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径（不存在时使用默认配置）
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// NTRIP 绑定地址，覆盖配置文件
    #[arg(short, long, env = "NTRIP_BIND_ADDR")]
    bind_addr: Option<SocketAddr>,

    /// 状态接口绑定地址，覆盖配置文件
    #[arg(long, env = "NTRIP_API_BIND_ADDR")]
    api_bind_addr: Option<SocketAddr>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = config::load(&args.config)?;
    if let Some(bind_addr) = args.bind_addr {
        config.bind_addr = bind_addr;
    }
    if let Some(api_bind_addr) = args.api_bind_addr {
        config.api.bind_addr = api_bind_addr;
    }

    init_tracing(&config.log);
    info!("NTRIP Caster starting with config: {}", args.config);

    let rt = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    rt.block_on(start_server(config))?;
    Ok(())
}
