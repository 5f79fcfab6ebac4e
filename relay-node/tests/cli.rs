use assert_cmd::Command;
use serde_json::Value;
use std::path::Path;

const FINGERPRINT: &str = "89A5EF566C85E88391886220F7439DEDD967EF62";
const ADDRESS: &str = "0x6d454e61876334ee2ca473e3b4b66777c931886e";
const PUBLIC_KEY: &str = "8ac7f77ca08a2402424608694e76cf9a126351cf62b27204c96b0d5d71887634240bf6a034d08c54dd7ea66c46cec9b97bf9861931bd3e69c2eac899551a66cb";
const SIGNATURE: &str = "f9fd49a43376f7dae87c2c95f14553feec317e93967db97bdcf7b5232616d551167555f90173bf6178f7e8a2aa71834932dbcdff26f0ae26b88c00cb0d09f174";

const CONFIG: &str = r#"
[logging]
level = "warn"

[distribution]
poll_interval_ms = 10
pacing = { mode = "fixed", delay_ms = 0 }

[claims]
pacing = { mode = "fixed", delay_ms = 0 }
"#;

fn relay_node_cmd(cwd: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("relay-node"));
    cmd.current_dir(cwd)
        .env_remove("RELAY_NODE_CONFIG")
        .env_remove("RUST_LOG");
    cmd
}

fn stdout_json(out: &std::process::Output) -> Value {
    serde_json::from_slice(&out.stdout).expect("stdout json")
}

fn verify_args(signature: &str) -> Vec<String> {
    [
        ("--node-id", "relay"),
        ("--nft-id", "0"),
        ("--device-serial", "c2eeef8a42a50073"),
        ("--atec-serial", "01237da6e721dcce01"),
        ("--fingerprint", FINGERPRINT),
        ("--address", ADDRESS),
        ("--public-key", PUBLIC_KEY),
        ("--signature", signature),
    ]
    .iter()
    .flat_map(|(k, v)| [k.to_string(), v.to_string()])
    .collect()
}

#[test]
fn verify_attestation_accepts_the_known_signature() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let out = relay_node_cmd(tmp.path())
        .arg("verify-attestation")
        .args(verify_args(SIGNATURE))
        .output()
        .expect("run");
    assert!(out.status.success());
    assert_eq!(stdout_json(&out), Value::Bool(true));
}

#[test]
fn verify_attestation_rejects_a_tampered_signature() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let mut tampered = SIGNATURE.to_string();
    tampered.replace_range(0..1, "0");
    let out = relay_node_cmd(tmp.path())
        .arg("verify-attestation")
        .args(verify_args(&tampered))
        .output()
        .expect("run");
    assert!(out.status.success());
    assert_eq!(stdout_json(&out), Value::Bool(false));
}

#[test]
fn mock_distribution_persists_a_queryable_result() {
    let tmp = tempfile::tempdir().expect("tempdir");
    std::fs::write(tmp.path().join("relay-node.toml"), CONFIG).expect("config");
    let scores: Vec<Value> = (1..=3)
        .map(|i| {
            serde_json::json!({
                "address": format!("0x{i:040x}"),
                "fingerprint": format!("{i:040X}"),
                "value": i * 100,
            })
        })
        .collect();
    std::fs::write(
        tmp.path().join("scores.json"),
        serde_json::to_vec(&scores).expect("encode"),
    )
    .expect("scores");

    let out = relay_node_cmd(tmp.path())
        .args([
            "--config",
            "relay-node.toml",
            "distribute",
            "--stamp",
            "42",
            "--scores",
            "scores.json",
        ])
        .output()
        .expect("run");
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let result = stdout_json(&out);
    assert_eq!(result["stamp"], 42);
    assert_eq!(result["complete"], Value::Bool(true));
    assert_eq!(result["scores"].as_array().map(Vec::len), Some(3));
    assert!(result["summary_ref"].is_string());

    let out = relay_node_cmd(tmp.path())
        .args(["--config", "relay-node.toml", "epoch", "status", "--stamp", "42"])
        .output()
        .expect("run");
    assert!(out.status.success());
    assert_eq!(stdout_json(&out), result);

    let out = relay_node_cmd(tmp.path())
        .args(["--config", "relay-node.toml", "epoch", "status", "--stamp", "43"])
        .output()
        .expect("run");
    assert_eq!(out.status.code(), Some(2));
}

#[test]
fn mock_claim_decides_every_relay() {
    let tmp = tempfile::tempdir().expect("tempdir");
    std::fs::write(tmp.path().join("relay-node.toml"), CONFIG).expect("config");
    let relays = serde_json::json!([
        { "fingerprint": "A".repeat(40), "address": format!("0x{}", "1".repeat(40)) },
        { "fingerprint": "not-a-fingerprint", "address": format!("0x{}", "2".repeat(40)) },
        { "fingerprint": "B".repeat(40), "address": format!("0x{}", "3".repeat(40)), "family": ["C".repeat(40)] }
    ]);
    std::fs::write(
        tmp.path().join("relays.json"),
        serde_json::to_vec(&relays).expect("encode"),
    )
    .expect("relays");

    let out = relay_node_cmd(tmp.path())
        .args(["--config", "relay-node.toml", "claim", "--relays", "relays.json"])
        .output()
        .expect("run");
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let v = stdout_json(&out);
    let results = |key: &str| -> Vec<String> {
        v[key]
            .as_array()
            .expect("array")
            .iter()
            .map(|d| d["result"].as_str().unwrap_or_default().to_string())
            .collect()
    };
    assert_eq!(results("claims"), vec!["OK", "Failed", "OK"]);
    assert_eq!(results("families"), vec!["AlreadySetFamily", "Failed", "OK"]);
}

#[test]
fn mock_claim_verifies_hardware_for_a_configured_sale() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let config = format!(
        "{CONFIG}\n[[registry.mock_sales]]\ndevice_serial = \"c2eeef8a42a50073\"\nnft_id = 0\nowner = \"{ADDRESS}\"\n"
    );
    std::fs::write(tmp.path().join("relay-node.toml"), config).expect("config");
    let relays = serde_json::json!([{
        "fingerprint": FINGERPRINT,
        "address": ADDRESS,
        "hardware": {
            "node_id": "relay",
            "nft_id": 0,
            "device_serial": "c2eeef8a42a50073",
            "atec_serial": "01237da6e721dcce01",
            "public_key": PUBLIC_KEY,
            "signature": SIGNATURE,
        }
    }]);
    std::fs::write(
        tmp.path().join("relays.json"),
        serde_json::to_vec(&relays).expect("encode"),
    )
    .expect("relays");

    let out = relay_node_cmd(tmp.path())
        .args(["--config", "relay-node.toml", "claim", "--relays", "relays.json"])
        .output()
        .expect("run");
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(stdout_json(&out)["claims"][0]["result"], "OK");

    let out = relay_node_cmd(tmp.path())
        .args([
            "--config",
            "relay-node.toml",
            "hardware",
            "lookup",
            "--device-serial",
            "c2eeef8a42a50073",
        ])
        .output()
        .expect("run");
    assert!(out.status.success());
    assert_eq!(stdout_json(&out)["fingerprint"], FINGERPRINT);
}
