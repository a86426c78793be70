use super::*;
use nostr_connect_api::dependencies::zeroize::Zeroizing;

#[derive(serde::Serialize)]
#[serde(crate = "nostr_connect_api::dependencies::serde")]
struct Keypair<'a> {
    public_key: PublicKey,
    secret_key: &'a str,
}

pub(crate) async fn exec() -> ConnectResult<()> {
    let identity = EphemeralIdentity::generate()?;
    let secret = identity.secret_key().to_hex();
    let yaml = Zeroizing::new(
        serde_yaml::to_string(&Keypair {
            public_key: identity.public_key(),
            secret_key: &secret,
        })
        .map_err(ConfigError::from)?,
    );
    print!("{}", yaml.as_str());
    Ok(())
}
