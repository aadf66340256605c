// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use upanel_server::config::{self, Args, ServerEntry, StorageKind};
use upanel_server::context::CancelToken;
use upanel_server::control::ControlManager;
use upanel_server::error::Result;
use upanel_server::history::{DiskStore, HistoryStore, MemoryStore};
use upanel_server::http::{start_http, AppState};
use upanel_server::hub::EventHub;
use upanel_server::logsessions;
use upanel_server::manager::{Instance, ServerManager};
use upanel_server::recording::{LogBackend, Manager as RecordingManager};
use upanel_server::sensorcfg::SensorCatalog;

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_format, &args.log_level);

    let servers: Vec<ServerEntry> = match &args.servers_file {
        Some(path) => config::load_servers(path)?,
        None => vec![ServerEntry {
            id: String::new(),
            name: String::new(),
            url: args.uniset_url.clone(),
        }],
    };

    let catalog = match &args.sensors_file {
        Some(path) => {
            let catalog = SensorCatalog::load(path)?;
            info!(sensors = catalog.count(), objects = catalog.object_count(), "sensor catalog loaded");
            Some(Arc::new(catalog))
        }
        None => None,
    };

    let storage: Arc<dyn HistoryStore> = match args.storage {
        StorageKind::Disk => {
            info!(dir = %args.data_dir.display(), "using disk storage");
            Arc::new(DiskStore::open(&args.data_dir)?)
        }
        StorageKind::Memory => {
            info!("using in-memory storage");
            Arc::new(MemoryStore::new())
        }
    };

    let hub = Arc::new(EventHub::new());
    let control = {
        let hub = Arc::clone(&hub);
        ControlManager::new(
            &args.control_tokens,
            args.control_timeout(),
            Box::new(move |status: &upanel_server::control::ControlStatus| {
                hub.broadcast_control_status(status)
            }),
        )
    };
    let recording = Arc::new(RecordingManager::new(
        Box::new(LogBackend::new(&args.recording_dir)),
        args.recording_max_records,
    ));

    let mut instances = Vec::with_capacity(servers.len());
    for entry in servers {
        let object_cb = {
            let hub = Arc::clone(&hub);
            let recording = Arc::clone(&recording);
            Arc::new(
                move |server_id: &str, _name: &str, object_name: &str, data: &upanel_server::upstream::ObjectData| {
                    hub.broadcast_object_data(object_name, data);
                    if let Some(variables) = &data.variables {
                        let now = chrono::Utc::now();
                        for (var_name, value) in variables {
                            let _ = recording.save(server_id, object_name, var_name, value.clone(), now);
                        }
                    }
                },
            ) as upanel_server::manager::ObjectEventCallback
        };
        let sensor_cb = {
            let hub = Arc::clone(&hub);
            let recording = Arc::clone(&recording);
            Arc::new(
                move |server_id: &str, _name: &str, updates: Vec<upanel_server::poller::SensorPollerUpdate>| {
                    hub.broadcast_sensor_poll_updates(&updates);
                    for update in &updates {
                        let _ = recording.save(
                            server_id,
                            &update.object_name,
                            &update.sensor.name,
                            json!(update.sensor.value),
                            update.timestamp,
                        );
                    }
                },
            ) as upanel_server::manager::SensorEventCallback
        };
        let ws_cb = {
            let hub = Arc::clone(&hub);
            Arc::new(
                move |_server_id: &str, _name: &str, updates: Vec<upanel_server::wsgate::SensorUpdate>| {
                    hub.broadcast_sensor_updates(&updates);
                },
            ) as upanel_server::manager::WsEventCallback
        };

        let instance = Instance::new(
            entry,
            Arc::clone(&storage),
            args.poll_interval(),
            args.history_ttl(),
            object_cb,
            sensor_cb,
            ws_cb,
        );

        {
            let recording = Arc::clone(&recording);
            let server_id = instance.server_id().to_string();
            instance.ws_poller.set_record_fn(Arc::new(
                move |object_name: &str, variable_name: &str, value: i64, timestamp| {
                    let _ = recording.save(
                        &server_id,
                        object_name,
                        variable_name,
                        json!(value),
                        timestamp,
                    );
                },
            ));
        }

        instances.push(instance);
    }
    let manager = Arc::new(ServerManager::new(instances));
    let log_sessions = logsessions::Manager::new(Arc::clone(&hub));

    let root = CancelToken::new();
    {
        let root = root.clone();
        ctrlc::set_handler(move || {
            eprintln!("\nreceived shutdown signal");
            root.cancel();
        })
        .expect("error setting signal handler");
    }

    control.start(&root);
    log_sessions.start(&root);
    manager.start_all(&root);

    let state = Arc::new(AppState {
        poll_interval: args.poll_interval(),
        manager: Arc::clone(&manager),
        storage: Arc::clone(&storage),
        hub: Arc::clone(&hub),
        control: Arc::clone(&control),
        log_sessions: Arc::clone(&log_sessions),
        recording: Arc::clone(&recording),
        catalog,
    });

    let _http = start_http(format!("0.0.0.0:{}", args.port), state, root.clone())?;
    info!(
        port = args.port,
        poll_interval_secs = args.poll_interval_secs,
        history_ttl_secs = args.history_ttl_secs,
        "upanel server started"
    );

    while !root.done() {
        thread::sleep(Duration::from_millis(100));
    }

    info!("shutting down");
    manager.stop_all();
    control.stop();
    log_sessions.stop();
    let _ = recording.close();
    storage.close()?;
    info!("shutdown complete");
    Ok(())
}

fn init_logging(format: &str, level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
        _ => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
}
