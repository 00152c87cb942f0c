//! Config file commands.

use anyhow::Result;

use super::Store;

pub fn set(store: &Store, key: &str, value: &str) -> Result<()> {
    let mut config = store.load_config()?;
    config.set(key, value)?;
    config.save(&store.config)?;
    println!("Config {} set to {}", key, config.get(key)?);
    Ok(())
}

pub fn get(store: &Store, key: &str) -> Result<()> {
    println!("{}", store.load_config()?.get(key)?);
    Ok(())
}

pub fn show(store: &Store) -> Result<()> {
    let config = store.load_config()?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
