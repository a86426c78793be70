use super::*;

pub(crate) async fn exec(config: EngineConfig) -> ConnectResult<()> {
    config.validate()?;
    print!("{}", config.to_yaml_string()?);
    Ok(())
}
