use kmp2mqtt::{Config, KmpManager, MqttManager};
use tokio::task::JoinHandle;
use std::time::Duration;
use log::{error, info};


#[tokio::main]
async fn main() {
    // Initialize logging
    let default_filter = std::env::var("K2M_LOG_LEVEL").unwrap_or("info".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            error!("Unable to load configuration: {e}");
            std::process::exit(1);
        }
    };

    // we need a channel for the subparts to send metering data to the handler
    let (mut mqtt, tx) = MqttManager::new(&config.mqtt);

    let mut threads: Vec<JoinHandle<()>> = Vec::new();

    threads.push(tokio::spawn(async move {
        mqtt.start_thread().await;
    }));

    let mut kmp = KmpManager::new(tx, config.kmp.clone(), config.mqtt.ha_enabled);
    threads.push(tokio::spawn(async move {
        kmp.start_thread().await;
    }));

    info!("All modules started, now waiting for a signal to exit");
    loop {
        tokio::time::sleep(Duration::from_secs(10)).await;
        let mut kill_all_tasks = false;
        for task in threads.iter() {
            if task.is_finished() {
                kill_all_tasks = true;
            }
        }

        if kill_all_tasks == true {
            for task in threads.iter_mut() {
                task.abort();
            }
            break;
        }
    }
}
