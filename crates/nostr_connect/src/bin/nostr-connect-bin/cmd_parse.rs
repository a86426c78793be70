use super::*;

pub(crate) async fn exec(opt: OptParse) -> ConnectResult<()> {
    let parsed = parse_any(&opt.uri)?;
    let yaml = serde_yaml::to_string(&parsed).map_err(ConfigError::from)?;
    print!("{yaml}");
    Ok(())
}
