//! `arenabridge validate` — strict check of every file in a data directory.

use std::path::Path;

use arenabridge_core::{BridgeConfig, DataPaths, Error};
use arenabridge_pool::{parse_pool_file, ModelCatalog};

#[derive(Debug, Default)]
pub struct ValidationReport {
    pub config_found: bool,
    pub catalog_models: usize,
    pub image_models: usize,
    pub pool_models: usize,
    pub default_configured: bool,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

pub fn validate(data_dir: &Path) -> ValidationReport {
    let mut report = ValidationReport::default();

    if !data_dir.is_dir() {
        report
            .errors
            .push(format!("Data directory not found: {}", data_dir.display()));
        return report;
    }
    let paths = match DataPaths::new(data_dir) {
        Ok(p) => p,
        Err(e) => {
            report.errors.push(format!("Cannot open data directory: {}", e));
            return report;
        }
    };

    // config.json
    match BridgeConfig::parse_file(&paths.config_file) {
        Ok(Some(config)) => {
            report.config_found = true;
            if config.file_bed.enabled && config.file_bed.active_upload_url().is_none() {
                report
                    .errors
                    .push("file_bed.enabled is set but file_bed.upload_url is empty".into());
            }
            if config.bypass_enabled && config.bypass_marker.trim().is_empty() {
                report
                    .errors
                    .push("bypass_enabled is set but bypass_marker is empty".into());
            }
            if config.first_event_timeout_secs == 0 || config.idle_timeout_secs == 0 {
                report.errors.push("relay timeouts must be greater than zero".into());
            }
        }
        Ok(None) => report
            .warnings
            .push("config.json not found, defaults will be used".into()),
        Err(e) => report.errors.push(format!("config.json: {}", e)),
    }

    // models.json
    let catalog = match ModelCatalog::parse_file(&paths.models_file) {
        Ok(catalog) => Some(catalog),
        Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            report
                .warnings
                .push("models.json not found, requests will carry no target model id".into());
            None
        }
        Err(e) => {
            report.errors.push(format!("models.json: {}", e));
            None
        }
    };
    if let Some(catalog) = &catalog {
        report.catalog_models = catalog.len();
        report.image_models = catalog
            .names()
            .filter(|n| catalog.kind_of(n) == arenabridge_pool::ModelKind::Image)
            .count();
    }

    // id_pool.json
    match parse_pool_file(&paths.id_pool_file) {
        Ok(pool) => {
            report.default_configured = pool.default.as_ref().is_some_and(|t| t.is_usable());
            for (name, entry) in pool.models {
                let tuples = entry.into_vec();
                let usable = tuples.iter().filter(|t| t.is_usable()).count();
                if usable == 0 {
                    report
                        .warnings
                        .push(format!("id_pool.json: model '{}' has no usable tuple", name));
                } else {
                    report.pool_models += 1;
                }
                if usable < tuples.len() && usable > 0 {
                    report.warnings.push(format!(
                        "id_pool.json: model '{}' has {} placeholder tuple(s)",
                        name,
                        tuples.len() - usable
                    ));
                }
                if let Some(catalog) = &catalog {
                    if catalog.get(&name).is_none() {
                        report.warnings.push(format!(
                            "id_pool.json: model '{}' is not in models.json",
                            name
                        ));
                    }
                }
            }
        }
        Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => report
            .warnings
            .push("id_pool.json not found, capture identifiers before serving".into()),
        Err(e) => report.errors.push(format!("id_pool.json: {}", e)),
    }

    if !report.default_configured && report.pool_models == 0 {
        report
            .warnings
            .push("No usable session identifiers; every chat request will fail".into());
    }

    report
}

pub fn print_report(report: &ValidationReport) {
    println!("=== arenabridge Data Validation ===");
    println!();
    println!("Config file:        {}", if report.config_found { "found" } else { "defaults" });
    println!("Catalog models:     {} ({} image)", report.catalog_models, report.image_models);
    println!("Pool models:        {}", report.pool_models);
    println!("Default tuple:      {}", if report.default_configured { "set" } else { "unset" });

    if !report.warnings.is_empty() {
        println!();
        println!("Warnings:");
        for w in &report.warnings {
            println!("  - {}", w);
        }
    }
    if !report.errors.is_empty() {
        println!();
        println!("Errors:");
        for e in &report.errors {
            println!("  - {}", e);
        }
    }
    println!();
    println!("Result: {}", if report.is_valid() { "OK" } else { "FAILED" });
}
