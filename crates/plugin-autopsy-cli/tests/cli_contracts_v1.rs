#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use rusqlite::Connection;
use serde_json::{json, Value};
use ulid::Ulid;

fn autopsy_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_autopsy") {
        Ok(value) => PathBuf::from(value),
        Err(_) => {
            let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/autopsy");
            if !path.exists() {
                let status = Command::new("cargo")
                    .args(["build", "-p", "plugin-autopsy-cli", "--bin", "autopsy"])
                    .status();
                match status {
                    Ok(value) if value.success() => {}
                    Ok(value) => panic!("failed to build autopsy binary (status={value})"),
                    Err(err) => panic!("failed to invoke cargo build: {err}"),
                }
            }
            path
        }
    }
}

fn autopsy_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(autopsy_binary_path());
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run autopsy command {:?}: {err}", args),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn write_capture_fixture() -> PathBuf {
    let path = std::env::temp_dir().join(format!("autopsy-capture-{}.json", Ulid::new()));
    let capture = json!({
        "page_context": "/checkout/",
        "baseline": {"resident_bytes": 4_000_000, "peak_bytes": 4_000_000},
        "final": {"resident_bytes": 5_000_000, "peak_bytes": 5_200_000},
        "events": [
            {"kind": "snapshot", "checkpoint": "extensions_loaded",
             "memory": {"resident_bytes": 4_200_000}},
            {"kind": "begin_hook", "checkpoint": "enqueue_scripts",
             "callbacks": [
                {"name": "shop_assets",
                 "declared_in": "/var/www/html/wp-content/plugins/shop/shop.php"}
             ],
             "memory": {"resident_bytes": 4_300_000}},
            {"kind": "end_hook", "checkpoint": "enqueue_scripts",
             "memory": {"resident_bytes": 4_700_000}},
            {"kind": "query", "sql": "SELECT * FROM wp_shop_cart WHERE token = 'abc123'",
             "duration_seconds": 0.09,
             "stack": "#0 /var/www/html/wp-content/plugins/shop/cart.php(88): Shop\\Cart->load()"},
            {"kind": "assets", "context": "front", "assets": [
                {"handle": "shop-cart", "kind": "script",
                 "src": "https://example.com/wp-content/plugins/shop/cart.js"}
            ]},
            {"kind": "snapshot", "checkpoint": "shutdown",
             "memory": {"resident_bytes": 5_000_000}}
        ],
        "query_log": [
            {"sql": "SELECT * FROM wp_shop_cart WHERE token = 'abc123'",
             "duration_seconds": 0.0912,
             "stack": "/var/www/html/wp-content/plugins/shop/cart.php(88): Shop\\Cart->load()"}
        ],
        "asset_sizes": {"https://example.com/wp-content/plugins/shop/cart.js": 64_000}
    });
    if let Err(err) = std::fs::write(&path, capture.to_string()) {
        panic!("failed to write capture fixture: {err}");
    }
    path
}

#[test]
fn help_contract_lists_expected_subcommands() {
    for (args, required) in [
        (vec!["--help"], vec!["report", "admin", "record"]),
        (
            vec!["report", "--help"],
            vec![
                "overview",
                "queries",
                "assets",
                "memory",
                "recommendations",
                "comparison",
            ],
        ),
        (vec!["admin", "--help"], vec!["refresh", "purge", "slow-queries"]),
    ] {
        let output = match Command::new(autopsy_binary_path()).args(&args).output() {
            Ok(value) => value,
            Err(err) => panic!("failed to run help command: {err}"),
        };
        assert!(output.status.success());
        let stdout = String::from_utf8_lossy(&output.stdout);
        for name in required {
            assert!(
                stdout.contains(name),
                "expected help output of {:?} to contain {name}; output={stdout}",
                args
            );
        }
    }
}

#[test]
fn record_then_report_json_contracts_are_versioned() {
    let db_path =
        std::env::temp_dir().join(format!("autopsy-contract-record-{}.sqlite3", Ulid::new()));
    let capture_path = write_capture_fixture();
    let capture_arg = capture_path.to_str().unwrap_or("");

    let record_output = autopsy_output(&db_path, &["record", "--capture", capture_arg, "--json"]);
    assert!(
        record_output.status.success(),
        "record command failed: {}",
        String::from_utf8_lossy(&record_output.stderr)
    );
    let record_payload = stdout_json(&record_output);
    assert_eq!(record_payload["contract_version"], json!("record.v1"));
    assert_eq!(record_payload["outcome"]["summary"]["dropped"], json!(0));
    assert_eq!(record_payload["outcome"]["summary"]["query_records"], json!(1));
    assert_eq!(record_payload["outcome"]["summary"]["asset_records"], json!(1));

    let conn = match Connection::open(&db_path) {
        Ok(value) => value,
        Err(err) => panic!("failed to open written db: {err}"),
    };
    let stored_sql = match conn.query_row(
        "SELECT payload_json FROM metric_records WHERE metric_type = 'query'",
        [],
        |row| row.get::<_, String>(0),
    ) {
        Ok(value) => value,
        Err(err) => panic!("failed to read stored query record: {err}"),
    };
    assert!(!stored_sql.contains("abc123"), "stored SQL must be redacted");

    for (report, contract) in [
        ("overview", "overview.v1"),
        ("queries", "queries.v1"),
        ("assets", "assets.v1"),
        ("memory", "memory.v1"),
        ("recommendations", "recommendations.v1"),
        ("comparison", "comparison.v1"),
    ] {
        let output = autopsy_output(&db_path, &["report", report, "--range", "1h", "--json"]);
        assert!(
            output.status.success(),
            "report {report} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        let payload = stdout_json(&output);
        assert_eq!(payload["contract_version"], json!(contract));
        assert_eq!(payload["range"], json!("1h"));
    }

    let overview = stdout_json(&autopsy_output(&db_path, &["report", "overview", "--json"]));
    assert_eq!(overview["report"]["total_extensions"], json!(1));
    assert_eq!(overview["report"]["top_extensions"][0]["slug"], json!("shop"));

    let _ = std::fs::remove_file(&db_path);
    let _ = std::fs::remove_file(&capture_path);
}

#[test]
fn slow_query_error_shape_for_missing_extension_is_stable() {
    let db_path =
        std::env::temp_dir().join(format!("autopsy-contract-slow-{}.sqlite3", Ulid::new()));

    let output = autopsy_output(&db_path, &["admin", "slow-queries", "--extension", ""]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("Plugin parameter is required"),
        "expected stable error shape, got stderr={stderr}"
    );

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn invalid_config_file_exits_non_zero() {
    let db_path =
        std::env::temp_dir().join(format!("autopsy-contract-config-{}.sqlite3", Ulid::new()));
    let config_path = std::env::temp_dir().join(format!("autopsy-config-{}.json", Ulid::new()));
    if let Err(err) = std::fs::write(&config_path, r#"{"retention_days": 0}"#) {
        panic!("failed to write config fixture: {err}");
    }

    let mut command = Command::new(autopsy_binary_path());
    command
        .arg("--db")
        .arg(&db_path)
        .arg("--config")
        .arg(&config_path)
        .args(["admin", "refresh"]);
    let output = match command.output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run autopsy: {err}"),
    };
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("configuration error"),
        "expected configuration error, got stderr={stderr}"
    );

    let _ = std::fs::remove_file(&config_path);
}
