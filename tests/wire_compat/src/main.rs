fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use meshrelay_connection::RelayEndpointConfig;
    use meshrelay_hub::HubStatus;
    use meshrelay_protocol::{AuthRequiredNotice, RelayMessage};

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    /// Loads a fixture JSON file and returns it as a `serde_json::Value`.
    fn load_fixture(name: &str) -> serde_json::Value {
        let path = fixtures_dir().join(name);
        let data = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()));
        serde_json::from_str(&data)
            .unwrap_or_else(|e| panic!("failed to parse fixture {}: {e}", path.display()))
    }

    /// Normalizes numbers so that `65` and `65.0` compare as equal.
    fn normalize_value(v: &serde_json::Value) -> serde_json::Value {
        match v {
            serde_json::Value::Number(n) => match n.as_f64() {
                Some(f) => serde_json::json!(f),
                None => v.clone(),
            },
            serde_json::Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), normalize_value(v)))
                    .collect(),
            ),
            serde_json::Value::Array(arr) => {
                serde_json::Value::Array(arr.iter().map(normalize_value).collect())
            }
            _ => v.clone(),
        }
    }

    /// Deserializes a fixture, re-serializes it, and compares the JSON
    /// values (order-independent, number-normalized). Returns the parsed value.
    fn roundtrip_test<T>(name: &str) -> T
    where
        T: serde::de::DeserializeOwned + serde::Serialize,
    {
        let fixture = load_fixture(name);
        let parsed: T = serde_json::from_value(fixture.clone())
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let reserialized = serde_json::to_value(&parsed)
            .unwrap_or_else(|e| panic!("failed to re-serialize {name}: {e}"));

        assert_eq!(
            normalize_value(&fixture),
            normalize_value(&reserialized),
            "roundtrip mismatch for {name}:\n  fixture: {fixture}\n  ours:    {reserialized}"
        );
        parsed
    }

    // --- Relay messages ---

    #[test]
    fn fixture_presence_message() {
        let msg: RelayMessage = roundtrip_test("presence_message.json");
        let presence = msg.presence();
        assert_eq!(presence.id.as_deref(), Some("agent-1"));
        assert_eq!(presence.agents, Some(vec!["a".to_string()]));
    }

    #[test]
    fn fixture_directed_message_keeps_unknown_fields() {
        let msg: RelayMessage = roundtrip_test("directed_message.json");
        assert_eq!(msg.to.as_deref(), Some("agent-7"));
        // `from` wins over `instanceId`.
        assert_eq!(msg.sender_id(), Some("planner-ui"));
        assert_eq!(msg.extra["timestamp"], 1_700_000_000_123u64);
        assert!(msg.presence().agents.is_none());
    }

    #[test]
    fn fixture_instance_presence() {
        let msg: RelayMessage = roundtrip_test("instance_presence.json");
        let presence = msg.presence();
        assert_eq!(presence.id.as_deref(), Some("tab-9a01"));
        assert_eq!(
            presence.agents,
            Some(vec!["researcher".into(), "writer".into(), "3".into()])
        );
    }

    #[test]
    fn relay_message_reparse_is_stable() {
        let text = fs::read_to_string(fixtures_dir().join("directed_message.json")).unwrap();
        let once = RelayMessage::parse(&text).unwrap();
        let twice = RelayMessage::parse(&once.to_json().unwrap()).unwrap();
        assert_eq!(once, twice);
    }

    // --- Persisted client config ---

    #[test]
    fn fixture_agentcore_config() {
        let config: RelayEndpointConfig = roundtrip_test("agentcore_config.json");
        assert_eq!(config.credentials.expiration, Some(1_700_003_600));
        let identity = config.federated_identity().expect("federated identity");
        assert_eq!(
            identity.provider_name,
            "cognito-idp.us-west-2.amazonaws.com/us-west-2_AbCdEf"
        );
    }

    #[test]
    fn fixture_agentcore_config_static() {
        let config: RelayEndpointConfig = roundtrip_test("agentcore_config_static.json");
        assert!(config.credentials.session_token.is_none());
        assert!(config.credentials.expiration.is_none());
        assert!(config.federated_identity().is_none());
    }

    #[test]
    fn config_written_with_resource_id_key_loads() {
        let mut fixture = load_fixture("agentcore_config_static.json");
        let obj = fixture.as_object_mut().unwrap();
        let arn = obj.remove("arn").unwrap();
        obj.insert("resourceId".into(), arn.clone());

        let config: RelayEndpointConfig = serde_json::from_value(fixture).unwrap();
        assert_eq!(config.resource_id, arn.as_str().unwrap());
        // Always written back under `arn`.
        let out = serde_json::to_value(&config).unwrap();
        assert_eq!(out["arn"], arn);
        assert!(out.get("resourceId").is_none());
    }

    // --- Notifications and status ---

    #[test]
    fn fixture_auth_required_notice() {
        let notice: AuthRequiredNotice = roundtrip_test("auth_required_notice.json");
        assert_eq!(notice, AuthRequiredNotice::credentials_expired());
        assert_eq!(notice.event_name(), "relay-auth-required");
    }

    #[test]
    fn fixture_hub_status() {
        let status: HubStatus = roundtrip_test("hub_status.json");
        assert_eq!(status.session_count, 3);
        assert_eq!(status.peers.len(), 2);
        assert_eq!(status.peers[1].agents, 3);
    }
}
