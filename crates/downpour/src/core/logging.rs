//! Logging initialization and configuration checking
//!
//! This module provides:
//! - Logger initialization (console + file)
//! - Credential source validation and logging
//! - Startup diagnostics

use anyhow::Result;
use simplelog::*;
use std::fs::File;

use crate::core::config;

/// Initialize logger for both console and file output
///
/// # Arguments
/// * `log_file_path` - Path to the log file
///
/// # Returns
/// * `Ok(())` - Logger initialized successfully
/// * `Err(anyhow::Error)` - Failed to initialize logger
pub fn init_logger(log_file_path: &str) -> Result<()> {
    let log_file = File::create(log_file_path).map_err(|e| anyhow::anyhow!("Failed to create log file: {}", e))?;

    CombinedLogger::init(vec![
        TermLogger::new(
            LevelFilter::Info,
            Config::default(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ),
        WriteLogger::new(LevelFilter::Info, Config::default(), log_file),
    ])
    .map_err(|e| anyhow::anyhow!("Failed to initialize logger: {}", e))?;

    Ok(())
}

/// Logs credential source configuration at engine startup
///
/// Validates and logs:
/// - COOKIES_DIR existence and contents
/// - COOKIES_URL configuration
/// - Provides troubleshooting guidance if no credential source is configured
pub fn log_credentials_configuration() {
    log::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    log::info!("🍪 Credential Sources Check");
    log::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    // Check cookies directory
    let cookies_dir = config::COOKIES_DIR.as_str();
    let expanded = shellexpand::tilde(cookies_dir).to_string();
    let dir_path = std::path::Path::new(&expanded);

    let mut dir_usable = false;
    if dir_path.is_dir() {
        let txt_count = std::fs::read_dir(dir_path)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| {
                        e.path()
                            .extension()
                            .map(|ext| ext.eq_ignore_ascii_case("txt"))
                            .unwrap_or(false)
                    })
                    .count()
            })
            .unwrap_or(0);

        if txt_count > 0 {
            log::info!("✅ COOKIES_DIR: {} ({} cookie file(s))", expanded, txt_count);
            log::info!("   Files will be imported into the credential pool at startup");
            dir_usable = true;
        } else {
            log::warn!("⚠️  COOKIES_DIR: {} (directory exists but holds no .txt files)", expanded);
        }
    } else {
        log::warn!("⚠️  COOKIES_DIR: {} (not found)", expanded);
        log::warn!("   Checked path: {}", expanded);
    }

    // Check remote bundle URL
    let url_set = match *config::COOKIES_URL {
        Some(ref url) => {
            log::info!("✅ COOKIES_URL: {}", url);
            log::info!("   Remote bundle will be fetched and imported at startup");
            true
        }
        None => {
            log::warn!("⚠️  COOKIES_URL: not set");
            false
        }
    };

    // Final status
    if dir_usable || url_set {
        log::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        log::info!("✅ Credential sources configured - authenticated downloads should work");
        log::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    } else {
        log::error!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        log::error!("❌ NO CREDENTIAL SOURCES CONFIGURED - authenticated downloads will FAIL!");
        log::error!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        log::error!("");
        log::error!("Quick fix:");
        log::error!("");
        log::error!("💡 Option 1: Cookie directory:");
        log::error!("  1. Export cookies from a logged-in browser (Netscape format)");
        log::error!("  2. Drop the .txt files into ./cookies/");
        log::error!("  3. Restart the engine");
        log::error!("");
        log::error!("💡 Option 2: Remote bundle:");
        log::error!("  1. Host a cookie bundle behind an authenticated URL");
        log::error!("  2. Set: export COOKIES_URL=https://example.com/cookies.txt");
        log::error!("  3. Restart the engine");
        log::error!("");
        log::error!("💡 Option 3: Feed credentials through the API at runtime");
        log::error!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }
}
