//! `GW_` environment overrides layered over the settings file.

use groundwork::Settings;
use groundwork::config::{ConflictPolicy, StoreBackend};
use std::env;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_env_overrides_file_values() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("settings.toml");
    fs::write(
        &config_path,
        "[retrieval]\ntop_k = 4\n\n[store]\nbackend = \"sqlite\"\n",
    )
    .unwrap();

    unsafe {
        // Double underscore separates nested levels
        env::set_var("GW_RETRIEVAL__TOP_K", "11");
        env::set_var("GW_INGESTION__ON_CONFLICT", "fail");
        env::set_var("GW_CHUNKING__WINDOW_SIZE", "300");
    }

    let settings = Settings::load_from(&config_path).unwrap();

    unsafe {
        env::remove_var("GW_RETRIEVAL__TOP_K");
        env::remove_var("GW_INGESTION__ON_CONFLICT");
        env::remove_var("GW_CHUNKING__WINDOW_SIZE");
    }

    assert_eq!(settings.retrieval.top_k, 11, "env wins over the file");
    assert_eq!(settings.ingestion.on_conflict, ConflictPolicy::Fail);
    assert_eq!(settings.chunking.window_size, 300);
    // File values without an override survive
    assert_eq!(settings.store.backend, StoreBackend::Sqlite);
    assert_eq!(settings.chunking.overlap, 64);
}

#[test]
fn test_init_file_round_trips() {
    let temp_dir = TempDir::new().unwrap();
    let path = Settings::init_config_file(temp_dir.path(), false).unwrap();
    assert!(path.exists());
    assert!(Settings::init_config_file(temp_dir.path(), false).is_err());
    assert!(Settings::init_config_file(temp_dir.path(), true).is_ok());

    let settings = Settings::load_from(&path).unwrap();
    assert!(settings.validate().is_ok());
}
