//! End-to-end interception through the simulated host

use std::sync::Arc;

use serde_json::Value;

use delegation_forge::app::Config;
use delegation_forge::crypto::{CryptoProvider, KeyPair, ManagedProvider};
use delegation_forge::delegation::signable::signable_bytes;
use delegation_forge::delegation::{
    self, Curve, Delegation, DelegationChain, Principal, SignedDelegation, WireFormat,
};
use delegation_forge::export::{validate_artifact, AUTH_CLIENT_DATABASE, DELEGATION_ENTRY};
use delegation_forge::forgery::now_nanos;
use delegation_forge::host::{InterceptedExchange, SimulatedHost};
use delegation_forge::keystore::Fingerprint;
use delegation_forge::Extension;

const SECOND: u64 = 1_000_000_000;
const HOUR: u64 = 3600 * SECOND;
const URL: &str = "https://identity.ic0.app/authorize";

fn key() -> KeyPair {
    ManagedProvider.generate_key_pair(Curve::P256).unwrap()
}

/// root → intermediate → `session`, both hops genuinely signed
fn chain_to(session: Vec<u8>, expiration: u64, targets: Vec<Principal>, format: WireFormat) -> DelegationChain {
    let root = key();
    let intermediate = key();

    let first = Delegation {
        pubkey: intermediate.spki_der(),
        expiration,
        targets: vec![],
    };
    let second = Delegation {
        pubkey: session,
        expiration,
        targets,
    };
    let declare = |k: &KeyPair| (format == WireFormat::ChainJson).then(|| k.spki_der());

    DelegationChain {
        public_key: root.spki_der(),
        delegations: vec![
            SignedDelegation {
                signature: ManagedProvider.sign(&root, &signable_bytes(&first).unwrap()).unwrap(),
                delegation: first,
                signer: declare(&root),
            },
            SignedDelegation {
                signature: ManagedProvider.sign(&intermediate, &signable_bytes(&second).unwrap()).unwrap(),
                delegation: second,
                signer: declare(&intermediate),
            },
        ],
        format,
    }
}

fn two_hop(expiration: u64, targets: Vec<Principal>, format: WireFormat) -> DelegationChain {
    chain_to(key().spki_der(), expiration, targets, format)
}

/// DER SPKI of an EC key on secp384r1
fn p384_spki() -> Vec<u8> {
    let mut der = vec![0x30, 0x76, 0x30, 0x10];
    der.extend_from_slice(&[0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01]);
    der.extend_from_slice(&[0x06, 0x05, 0x2b, 0x81, 0x04, 0x00, 0x22]);
    der.extend_from_slice(&[0x03, 0x62, 0x00, 0x04]);
    der.extend_from_slice(&[0x5a; 96]);
    der
}

/// Host plus extension whose default and max horizons are both 30 minutes
fn activate() -> (Arc<SimulatedHost>, Extension) {
    let mut config = Config::default();
    config.forgery.max_horizon_secs = 1800;
    config.forgery.default_horizon_secs = 1800;
    let host = Arc::new(SimulatedHost::default());
    let extension = Extension::activate(&config, host.clone()).unwrap();
    (host, extension)
}

fn response(body: Vec<u8>) -> InterceptedExchange {
    InterceptedExchange::new_response(7, "POST", URL, 200)
        .with_header("content-type", "application/json")
        .with_body(body)
}

fn assert_untouched(host: &SimulatedHost, extension: &Extension, exchange: InterceptedExchange) {
    assert_eq!(host.dispatch(exchange.clone()), exchange);
    assert_eq!(extension.store().map(|s| s.len()), Some(0));
    assert_eq!(extension.cache_stats().generations, 0);
    assert!(extension.artifacts().is_empty());
}

#[test]
fn scenario_a_valid_chain_is_forged() {
    let (host, extension) = activate();
    let targets = vec![Principal::from_text("rdmx6-jaaaa-aaaaa-aaadq-cai").unwrap()];
    let original = two_hop(now_nanos() + HOUR, targets.clone(), WireFormat::ChainJson);

    let before = now_nanos();
    let out = host.dispatch(response(delegation::encode(&original)));
    let after = now_nanos();

    let forged = delegation::parse(out.body.as_deref().unwrap()).unwrap();
    let terminal = forged.terminal().unwrap();
    assert_ne!(terminal.delegation.pubkey, original.terminal().unwrap().delegation.pubkey);
    assert_eq!(terminal.delegation.targets, targets);
    assert_eq!(forged.delegations[0], original.delegations[0]);
    assert!(terminal.delegation.expiration >= before + HOUR / 2);
    assert!(terminal.delegation.expiration <= after + HOUR / 2);

    let artifact = extension.artifacts().latest().unwrap();
    assert!(artifact.validate().is_ok());
    let value: Value = serde_json::from_str(&artifact.to_json_pretty()).unwrap();
    assert!(validate_artifact(&value).is_ok());
    assert_eq!(value["key"]["kty"], "EC");
    assert_eq!(value["key"]["crv"], "P-256");
    assert_eq!(value["storage"]["database"], AUTH_CLIENT_DATABASE);
    assert_eq!(value["storage"]["delete"][0], DELEGATION_ENTRY);

    // The exported key is the one substituted into the chain
    let fingerprint = Fingerprint::derive("identity.ic0.app", &original.session_id());
    assert_eq!(artifact.fingerprint, fingerprint.to_string());
    let key = extension.store().unwrap().get(&fingerprint).unwrap();
    assert_eq!(key.spki_der(), terminal.delegation.pubkey);
    assert_eq!(extension.interceptor_stats().forged, 1);
}

#[test]
fn scenario_a_compact_vector_keeps_its_shape() {
    let (host, extension) = activate();
    let original = two_hop(now_nanos() + HOUR, vec![], WireFormat::CompactVector);

    let out = host.dispatch(response(delegation::encode(&original)));
    let value: Value = serde_json::from_slice(out.body.as_deref().unwrap()).unwrap();
    assert!(value.get("fromPubKey").is_some());
    assert!(value.get("delegationChain").is_some());

    let forged = delegation::parse(out.body.as_deref().unwrap()).unwrap();
    assert_eq!(forged.format, WireFormat::CompactVector);
    assert!(forged.terminal().unwrap().delegation.targets.is_empty());
    assert_eq!(extension.artifacts().len(), 1);
}

#[test]
fn scenario_b_broken_linkage_passes_through() {
    let (host, extension) = activate();
    let mut original = two_hop(now_nanos() + HOUR, vec![], WireFormat::ChainJson);
    original.delegations[1].signer = Some(key().spki_der());

    assert_untouched(&host, &extension, response(delegation::encode(&original)));

    let diagnostics = host.diagnostics().get_all();
    assert_eq!(diagnostics.len(), 1);
    assert!(diagnostics[0].message.contains("integrity"));
    assert_eq!(diagnostics[0].exchange_id, Some(7));
    assert_eq!(extension.interceptor_stats().passed_through_on_error, 1);
}

#[test]
fn scenario_c_malformed_base64_passes_through() {
    let (host, extension) = activate();
    let original = two_hop(now_nanos() + HOUR, vec![], WireFormat::CompactVector);
    let mut value = delegation::to_json_value(&original);
    value["fromPubKey"] = Value::String("not*base64*at*all".into());

    assert_untouched(&host, &extension, response(serde_json::to_vec(&value).unwrap()));

    let parser = host.diagnostics().filter_by_stage("parser");
    assert_eq!(parser.len(), 1);
    assert!(parser[0].message.contains("Malformed"));
}

#[test]
fn scenario_d_unsupported_curve_passes_through() {
    let (host, extension) = activate();
    let original = chain_to(p384_spki(), now_nanos() + HOUR, vec![], WireFormat::ChainJson);

    assert_untouched(&host, &extension, response(delegation::encode(&original)));

    let parser = host.diagnostics().filter_by_stage("parser");
    assert_eq!(parser.len(), 1);
    assert!(parser[0].message.contains("Unsupported"));
}

#[test]
fn same_session_reuses_identity() {
    let (host, extension) = activate();
    let original = two_hop(now_nanos() + HOUR, vec![], WireFormat::ChainJson);
    let body = delegation::encode(&original);

    let first = host.dispatch(response(body.clone()));
    let second = host.dispatch(response(body));

    let key_of = |exchange: &InterceptedExchange| {
        delegation::parse(exchange.body.as_deref().unwrap())
            .unwrap()
            .terminal()
            .unwrap()
            .delegation
            .pubkey
            .clone()
    };
    assert_eq!(key_of(&first), key_of(&second));
    assert_eq!(extension.cache_stats().generations, 1);
    assert_eq!(extension.artifacts().len(), 2);
}

#[test]
fn deactivation_drains_identities() {
    let (host, extension) = activate();
    host.dispatch(response(delegation::encode(&two_hop(
        now_nanos() + HOUR,
        vec![],
        WireFormat::ChainJson,
    ))));
    assert_eq!(extension.store().map(|s| s.len()), Some(1));

    let report = extension.deactivate();
    assert_eq!(report.identities_drained, 1);
    assert_eq!(host.handler_count(), 0);
}

#[test]
fn unrelated_fields_are_forwarded_verbatim() {
    let (host, extension) = activate();
    let chain = String::from_utf8(delegation::encode(&two_hop(
        now_nanos() + HOUR,
        vec![],
        WireFormat::ChainJson,
    )))
    .unwrap();
    let prefix = r#"{"zeta":1,"nonce":123456789012345678901234567890,"price":1.10,"payload":{"chain":"#;
    let suffix = "}}";

    let out = host.dispatch(response(format!("{}{}{}", prefix, chain, suffix).into_bytes()));
    let out = String::from_utf8(out.body.unwrap()).unwrap();

    assert!(out.starts_with(prefix), "body rewritten outside the chain: {}", out);
    assert!(out.ends_with(suffix));
    assert_ne!(&out[prefix.len()..out.len() - suffix.len()], chain);
    assert_eq!(extension.interceptor_stats().forged, 1);
}
