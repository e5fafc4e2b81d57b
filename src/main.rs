#![cfg_attr(all(windows, not(debug_assertions)), windows_subsystem = "windows")]

use anyhow::Result;
use eframe::egui;
use tracing_subscriber::EnvFilter;

use llm_workbench::AppConfig;

mod chatapp;
mod chatapp_ui;

use chatapp::ChatApp;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = AppConfig::default_path();
    let config = AppConfig::load(&config_path)?;
    tracing::info!("Loaded settings from {:?}", config_path);

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([900.0, 700.0]),
        ..Default::default()
    };

    eframe::run_native(
        "LLM Workbench",
        options,
        Box::new(move |cc| Box::new(ChatApp::new(cc, config, config_path))),
    )
    .map_err(|e| anyhow::anyhow!("Failed to run app: {}", e))
}
