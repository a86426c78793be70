use super::*;

pub(crate) async fn exec(
    config: EngineConfig,
    opt: OptConnectUri,
) -> ConnectResult<()> {
    let relays = if opt.relays.is_empty() {
        config.default_relays
    } else {
        opt.relays
            .iter()
            .map(|r| RelayUrl::parse(r))
            .collect::<Result<Vec<_>, _>>()?
    };
    if relays.is_empty() {
        return Err(UriError::Malformed(
            "no relays given and none configured".into(),
        )
        .into());
    }

    let identity = EphemeralIdentity::generate()?;
    let secret = random_token()?;

    let mut uri = ConnectUri::new(&identity, relays);
    uri.secret = Some(secret.as_str().to_owned());
    uri.app_name = opt.name.or(config.app_name);
    uri.perms = opt.perms.or(config.perms);
    uri.url = config.app_url;
    uri.image = config.app_image;

    tracing::info!(
        client_pubkey = %identity.public_key(),
        relays = uri.relays.len(),
        "minted connect uri"
    );

    // only the uri goes to stdout so it can be piped
    println!("{uri}");

    Ok(())
}
