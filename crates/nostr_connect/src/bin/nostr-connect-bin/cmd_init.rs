use super::*;
use tokio::io::AsyncWriteExt;

pub(crate) async fn exec(config_n: std::path::PathBuf) -> ConnectResult<()> {
    if tokio::fs::metadata(&config_n).await.is_ok() {
        return Err(ConfigError::Io(format!(
            "{config_n:?} already exists - refusing to overwrite"
        ))
        .into());
    }

    if let Some(dir) = config_n.parent().filter(|d| !d.as_os_str().is_empty())
    {
        tokio::fs::DirBuilder::new()
            .recursive(true)
            .create(dir)
            .await
            .map_err(ConfigError::from)?;
    }

    let yaml = EngineConfig::default().to_yaml_string()?;

    let mut config_f = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&config_n)
        .await
        .map_err(ConfigError::from)?;
    config_f
        .write_all(yaml.as_bytes())
        .await
        .map_err(ConfigError::from)?;
    config_f.shutdown().await.map_err(ConfigError::from)?;
    drop(config_f);

    println!("# nostr-connect init config:\n{}", config_n.display());

    Ok(())
}
