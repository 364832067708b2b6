use std::str::FromStr;

use tracing_subscriber::{prelude::*, Registry};

#[derive(Debug)]
pub struct TraceConfig {
    pub level: String,
    pub format: String,
    pub file: Option<String>,
}

pub async fn prepare_tracing(conf: TraceConfig) {
    let level = tracing_subscriber::filter::LevelFilter::from_str(&conf.level)
        .unwrap_or(tracing_subscriber::filter::LevelFilter::INFO);

    if conf.format == "json" {
        if let Some(path) = conf.file {
            let file = std::fs::File::create(path).unwrap();
            Registry::default()
                .with(tracing_subscriber::fmt::Layer::new().with_writer(file))
                .with(tracing_subscriber::fmt::Layer::new().with_ansi(true).json())
                .with(level)
                .init();
        } else {
            Registry::default()
                .with(tracing_subscriber::fmt::Layer::new().with_ansi(true).json())
                .with(level)
                .init();
        }
    } else if let Some(path) = conf.file {
        let file = std::fs::File::create(path).unwrap();
        Registry::default()
            .with(tracing_subscriber::fmt::Layer::new().with_writer(file))
            .with(tracing_subscriber::fmt::Layer::new().with_ansi(true))
            .with(level)
            .init();
    } else {
        Registry::default()
            .with(tracing_subscriber::fmt::Layer::new().with_ansi(true))
            .with(level)
            .init();
    }
}
