//! Parsing and building of `nostrconnect://` and `bunker://` uris.
//!
//! Both schemes share the same shape:
//! `<scheme>://<64-hex pubkey>?relay=<url>&relay=<url>&secret=<token>...`.
//! Query values are form-urlencoded, so relay urls containing `&` or `=`
//! survive a round trip unchanged.

use crate::encoding::*;
use crate::identity::EphemeralIdentity;
use crate::*;
use url::form_urlencoded;

/// Scheme prefix of client-minted uris.
pub const CONNECT_SCHEME: &str = "nostrconnect";

/// Scheme prefix of signer-minted uris.
pub const BUNKER_SCHEME: &str = "bunker";

/// A uri minted by the client for the signer to scan.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ConnectUri {
    /// The client's ephemeral public key.
    pub client_pubkey: PublicKey,
    /// Relays the client listens on, in order. Never empty.
    pub relays: Vec<RelayUrl>,
    /// Token the signer echoes back to prove it scanned this uri.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// Application name shown by the signer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
    /// Requested permissions, comma separated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub perms: Option<String>,
    /// Application url shown by the signer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Application image shown by the signer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl ConnectUri {
    /// A bare connect uri for the given identity.
    pub fn new(identity: &EphemeralIdentity, relays: Vec<RelayUrl>) -> Self {
        Self {
            client_pubkey: identity.public_key(),
            relays,
            secret: None,
            app_name: None,
            perms: None,
            url: None,
            image: None,
        }
    }
}

impl std::fmt::Display for ConnectUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut query = form_urlencoded::Serializer::new(String::new());
        for relay in self.relays.iter() {
            query.append_pair("relay", relay.as_str());
        }
        let optional = [
            ("secret", &self.secret),
            ("name", &self.app_name),
            ("perms", &self.perms),
            ("url", &self.url),
            ("image", &self.image),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                query.append_pair(key, value);
            }
        }
        write!(
            f,
            "{CONNECT_SCHEME}://{}?{}",
            self.client_pubkey,
            query.finish()
        )
    }
}

/// A uri minted by a signer that is already waiting for clients.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct BunkerUri {
    /// The signer's communication public key.
    pub signer_pubkey: PublicKey,
    /// Relays the signer listens on, in order. Never empty.
    pub relays: Vec<RelayUrl>,
    /// Optional single-use token to present in `connect`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_secret: Option<String>,
}

impl std::fmt::Display for BunkerUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut query = form_urlencoded::Serializer::new(String::new());
        for relay in self.relays.iter() {
            query.append_pair("relay", relay.as_str());
        }
        if let Some(secret) = &self.connect_secret {
            query.append_pair("secret", secret);
        }
        write!(f, "{BUNKER_SCHEME}://{}?{}", self.signer_pubkey, query.finish())
    }
}

/// Either kind of uri.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ParsedUri {
    /// `nostrconnect://`
    Connect(ConnectUri),
    /// `bunker://`
    Bunker(BunkerUri),
}

/// Fields shared by both schemes, before scheme specific mapping.
struct RawUri {
    pubkey: PublicKey,
    relays: Vec<RelayUrl>,
    secret: Option<String>,
    name: Option<String>,
    perms: Option<String>,
    url: Option<String>,
    image: Option<String>,
}

fn split_scheme(uri: &str) -> Result<(String, &str), UriError> {
    let (scheme, rest) = uri
        .trim()
        .split_once("://")
        .ok_or_else(|| UriError::Malformed("missing scheme".into()))?;
    Ok((scheme.to_ascii_lowercase(), rest))
}

fn parse_raw(rest: &str) -> Result<RawUri, UriError> {
    let (authority, query) = match rest.split_once('?') {
        Some((a, q)) => (a, q),
        None => (rest, ""),
    };
    let authority = authority.strip_suffix('/').unwrap_or(authority);
    let pubkey: PublicKey = authority.parse()?;

    let mut out = RawUri {
        pubkey,
        relays: Vec::new(),
        secret: None,
        name: None,
        perms: None,
        url: None,
        image: None,
    };

    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        if value.is_empty() {
            continue;
        }
        match &*key {
            "relay" => out.relays.push(RelayUrl::parse(&value)?),
            "secret" => out.secret = Some(value.into_owned()),
            "name" => out.name = Some(value.into_owned()),
            "perms" => out.perms = Some(value.into_owned()),
            "url" => out.url = Some(value.into_owned()),
            "image" => out.image = Some(value.into_owned()),
            other => trace!(param = %other, "ignoring unknown uri parameter"),
        }
    }

    if out.relays.is_empty() {
        return Err(UriError::Malformed("no relay parameter".into()));
    }

    Ok(out)
}

/// Parse a `nostrconnect://` uri.
pub fn parse_connect(uri: &str) -> Result<ConnectUri, UriError> {
    let (scheme, rest) = split_scheme(uri)?;
    if scheme != CONNECT_SCHEME {
        return Err(UriError::Malformed(format!(
            "expected {CONNECT_SCHEME}:// uri, got {scheme}://"
        )));
    }
    let raw = parse_raw(rest)?;
    Ok(ConnectUri {
        client_pubkey: raw.pubkey,
        relays: raw.relays,
        secret: raw.secret,
        app_name: raw.name,
        perms: raw.perms,
        url: raw.url,
        image: raw.image,
    })
}

/// Parse a `bunker://` uri.
pub fn parse_bunker(uri: &str) -> Result<BunkerUri, UriError> {
    let (scheme, rest) = split_scheme(uri)?;
    if scheme != BUNKER_SCHEME {
        return Err(UriError::Malformed(format!(
            "expected {BUNKER_SCHEME}:// uri, got {scheme}://"
        )));
    }
    let raw = parse_raw(rest)?;
    Ok(BunkerUri {
        signer_pubkey: raw.pubkey,
        relays: raw.relays,
        connect_secret: raw.secret,
    })
}

/// Parse either scheme.
pub fn parse_any(uri: &str) -> Result<ParsedUri, UriError> {
    let (scheme, _) = split_scheme(uri)?;
    match scheme.as_str() {
        CONNECT_SCHEME => parse_connect(uri).map(ParsedUri::Connect),
        BUNKER_SCHEME => parse_bunker(uri).map(ParsedUri::Bunker),
        _ => Err(UriError::UnsupportedScheme(scheme)),
    }
}

/// Build a `nostrconnect://` uri advertising `identity` on `relays`.
///
/// An empty `app_name` is omitted.
pub fn build_connect(
    identity: &EphemeralIdentity,
    relays: &[RelayUrl],
    app_name: &str,
) -> String {
    let mut uri = ConnectUri::new(identity, relays.to_vec());
    if !app_name.is_empty() {
        uri.app_name = Some(app_name.to_string());
    }
    uri.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn hex_pk() -> String {
        format!("aa{}bb", "0".repeat(60))
    }

    fn relay(s: &str) -> RelayUrl {
        RelayUrl::parse(s).unwrap()
    }

    #[test]
    fn parse_connect_example() {
        let uri = format!(
            "nostrconnect://{}?relay=wss%3A%2F%2Fr.example&secret=deadbeef&name=Test",
            hex_pk(),
        );
        let parsed = parse_connect(&uri).unwrap();
        assert_eq!(
            ConnectUri {
                client_pubkey: hex_pk().parse().unwrap(),
                relays: vec!["wss://r.example".parse().unwrap()],
                secret: Some("deadbeef".into()),
                app_name: Some("Test".into()),
                perms: None,
                url: None,
                image: None,
            },
            parsed,
        );
    }

    #[test]
    fn parse_bunker_short_pubkey() {
        let uri = format!("bunker://{}", "a".repeat(33));
        assert!(matches!(parse_bunker(&uri), Err(UriError::Malformed(_))));
    }

    #[test]
    fn parse_requires_relay() {
        let uri = format!("bunker://{}?secret=abc", hex_pk());
        assert!(matches!(parse_bunker(&uri), Err(UriError::Malformed(_))));
    }

    #[test]
    fn wrong_scheme_is_malformed() {
        let uri = format!("bunker://{}?relay=wss://a.example", hex_pk());
        assert!(matches!(parse_connect(&uri), Err(UriError::Malformed(_))));
        assert!(matches!(parse_bunker(&uri), Ok(_)));
    }

    #[test]
    fn parse_any_dispatches() {
        let bunker = format!("bunker://{}?relay=wss://a.example", hex_pk());
        assert!(matches!(parse_any(&bunker), Ok(ParsedUri::Bunker(_))));
        let connect =
            format!("nostrconnect://{}?relay=wss://a.example", hex_pk());
        assert!(matches!(parse_any(&connect), Ok(ParsedUri::Connect(_))));
        let other = format!("https://{}?relay=wss://a.example", hex_pk());
        assert_eq!(
            Err(UriError::UnsupportedScheme("https".into())),
            parse_any(&other),
        );
    }

    #[test]
    fn bunker_multiple_relays_and_decoded_secret() {
        let uri = format!(
            "BUNKER://{}/?relay=wss%3A%2F%2Fone.example&relay=wss://two.example&secret=a%2Bb%3Dc",
            hex_pk().to_uppercase(),
        );
        let parsed = parse_bunker(&uri).unwrap();
        assert_eq!(hex_pk(), parsed.signer_pubkey.to_hex());
        assert_eq!(
            vec!["wss://one.example", "wss://two.example"],
            parsed.relays.iter().map(|r| r.as_str()).collect::<Vec<_>>(),
        );
        assert_eq!(Some("a+b=c".to_string()), parsed.connect_secret);
    }

    #[test]
    fn build_connect_round_trips_awkward_relays() {
        let identity = EphemeralIdentity::generate().unwrap();
        let relays: Vec<RelayUrl> = vec![
            "wss://b.example/path?x=1&y=2".parse().unwrap(),
            "wss://a.example".parse().unwrap(),
        ];
        let uri = build_connect(&identity, &relays, "My App");
        let parsed = parse_connect(&uri).unwrap();
        assert_eq!(identity.public_key(), parsed.client_pubkey);
        assert_eq!(relays, parsed.relays);
        assert_eq!(Some("My App".to_string()), parsed.app_name);
        assert_eq!(None, parsed.secret);

        let bare = build_connect(&identity, &relays, "");
        assert_eq!(None, parse_connect(&bare).unwrap().app_name);
    }

    #[test]
    fn connect_uri_display_round_trips_metadata() {
        let identity = EphemeralIdentity::generate().unwrap();
        let mut uri =
            ConnectUri::new(&identity, vec![relay("wss://r.example")]);
        uri.secret = Some("0f".repeat(16));
        uri.app_name = Some("App & Co".into());
        uri.perms = Some("sign_event:1,nip44_encrypt".into());
        uri.url = Some("https://app.example/?a=b".into());
        uri.image = Some("https://app.example/logo.png".into());
        assert_eq!(uri, parse_connect(&uri.to_string()).unwrap());
    }

    #[test]
    fn bunker_display_round_trips() {
        let bunker = BunkerUri {
            signer_pubkey: hex_pk().parse().unwrap(),
            relays: vec!["wss://r.example".parse().unwrap()],
            connect_secret: Some("token".into()),
        };
        assert_eq!(bunker, parse_bunker(&bunker.to_string()).unwrap());
    }
}
