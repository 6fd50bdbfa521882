use serde::Serialize;

/// The JSON document carried by the `CONNECT` frame
#[derive(Debug, Serialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct Connect {
    pub verbose: bool,
    pub pedantic: bool,
    pub tls_required: bool,
    #[serde(rename = "name", skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    #[serde(rename = "lang")]
    pub client_lang: &'static str,
    #[serde(rename = "version")]
    pub client_version: &'static str,
    pub protocol: u8,
    pub echo: bool,
    #[serde(rename = "headers")]
    pub supports_headers: bool,
    #[serde(rename = "no_responders")]
    pub supports_no_responders: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(rename = "user", skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(rename = "pass", skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nkey: Option<String>,
    #[serde(rename = "sig", skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Connect {
    /// A `CONNECT` document with no authentication fields set
    #[must_use]
    pub fn new(client_name: Option<String>) -> Self {
        Self {
            verbose: true,
            pedantic: false,
            tls_required: false,
            client_name,
            client_lang: "rust-pomelo",
            client_version: env!("CARGO_PKG_VERSION"),
            protocol: 1,
            echo: true,
            supports_headers: true,
            supports_no_responders: true,
            auth_token: None,
            username: None,
            password: None,
            jwt: None,
            nkey: None,
            signature: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Connect;

    #[test]
    fn auth_fields_are_omitted_when_unset() {
        let connect = Connect::new(Some("tester".to_owned()));
        let json = serde_json::to_string(&connect).unwrap();

        assert!(json.contains(r#""name":"tester""#));
        assert!(json.contains(r#""verbose":true"#));
        assert!(!json.contains("auth_token"));
        assert!(!json.contains("user"));
        assert!(!json.contains("sig"));
        assert!(!json.contains("nkey"));
    }
}
