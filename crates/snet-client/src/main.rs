//! 客户端进程入口：解析参数、初始化日志、运行反应器直至被信号终止。

use std::cell::RefCell;
use std::rc::Rc;

use snet_core::reactor::EventLoop;
use snet_core::socket::{ignore_sigpipe, raise_max_open_files};

use snet_client::{ClientComposition, Config};

/// 尽量提升到这个数量的打开文件描述符；达不到也不是致命错误。
const WANTED_OPEN_FILES: u64 = 65536;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    ignore_sigpipe();
    if let Err(err) = raise_max_open_files(WANTED_OPEN_FILES) {
        tracing::warn!(%err, "failed to raise RLIMIT_NOFILE, continuing with current limit");
    }

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = match Config::from_args(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };

    let reactor = Rc::new(RefCell::new(EventLoop::new()));
    let _composition = match ClientComposition::start(config, reactor.clone()) {
        Ok(composition) => composition,
        Err(err) => {
            tracing::error!(category = ?err.category(), %err, "failed to start client");
            std::process::exit(1);
        }
    };

    tracing::info!("snet-client running");
    EventLoop::run(&reactor);
}
