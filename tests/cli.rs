use assert_cmd::Command;
use datastore::Engine;
use predicates::str::{contains, is_empty};
use std::fs;
use std::path::Path;
use tempfile::TempDir;
use walkdir::WalkDir;

fn datastore(op: &str, db: &Path) -> Command {
    let mut cmd = Command::cargo_bin("datastore").unwrap();
    cmd.env_remove("DB_HOME").arg(op).arg("--db").arg(db);
    cmd
}

// 不带子命令时应该报错退出
#[test]
fn cli_no_args() {
    Command::cargo_bin("datastore")
        .unwrap()
        .assert()
        .failure()
        .code(2);
}

#[test]
fn cli_version() {
    Command::cargo_bin("datastore")
        .unwrap()
        .arg("-V")
        .assert()
        .stdout(contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn cli_missing_db() {
    Command::cargo_bin("datastore")
        .unwrap()
        .env_remove("DB_HOME")
        .args(&["get", "key1"])
        .assert()
        .failure();
}

#[test]
fn cli_invalid_engine() {
    let temp_dir = TempDir::new().unwrap();
    let db = temp_dir.path().join("db");
    datastore("put", &db)
        .args(&["-e", "unknown", "key1", "value1"])
        .assert()
        .failure();
    assert!(!db.exists());
}

#[test]
fn cli_put_get_args() {
    for engine in Engine::ALL {
        let temp_dir = TempDir::new().unwrap();
        let db = temp_dir.path().join("db");
        datastore("put", &db)
            .args(&["-e", engine.name(), "key1", "value1", "key2", "value2"])
            .assert()
            .success()
            .stdout(is_empty());

        datastore("get", &db)
            .args(&["-e", engine.name(), "key1", "zzz", "key2"])
            .assert()
            .success()
            .stdout("key1\tvalue1\nkey2\tvalue2\n");
    }
}

#[test]
fn cli_put_odd_args() {
    let temp_dir = TempDir::new().unwrap();
    let db = temp_dir.path().join("db");
    datastore("put", &db)
        .args(&["key1", "value1", "key2"])
        .assert()
        .failure()
        .stderr(contains("error"));
    assert!(!db.exists());
}

#[test]
fn cli_get_missing_key() {
    let temp_dir = TempDir::new().unwrap();
    let db = temp_dir.path().join("db");
    datastore("put", &db).args(&["key1", "value1"]).assert().success();
    datastore("get", &db)
        .args(&["zzz"])
        .assert()
        .success()
        .stdout(is_empty());
}

#[test]
fn cli_get_missing_store() {
    for engine in Engine::ALL {
        let temp_dir = TempDir::new().unwrap();
        let db = temp_dir.path().join("db");
        datastore("get", &db)
            .args(&["-e", engine.name(), "key1"])
            .assert()
            .failure()
            .code(1)
            .stderr(contains("not found"));
        assert_eq!(WalkDir::new(temp_dir.path()).into_iter().count(), 1);
    }
}

#[test]
fn cli_stdin_put_and_range_dump() {
    for engine in Engine::ALL {
        let temp_dir = TempDir::new().unwrap();
        let db = temp_dir.path().join("db");
        datastore("put", &db)
            .args(&["-e", engine.name()])
            .write_stdin("d\t4\nb\t2\n\na\t1\nc\t3\n")
            .assert()
            .success();

        datastore("dump", &db)
            .args(&["-e", engine.name()])
            .assert()
            .success()
            .stdout("a\t1\nb\t2\nc\t3\nd\t4\n");

        datastore("dump", &db)
            .args(&["-e", engine.name(), "-L", "b", "-U", "c"])
            .assert()
            .success()
            .stdout("b\t2\nc\t3\n");
    }
}

#[test]
fn cli_dump_rejects_positionals() {
    let temp_dir = TempDir::new().unwrap();
    let db = temp_dir.path().join("db");
    datastore("put", &db).args(&["key1", "value1"]).assert().success();
    datastore("dump", &db)
        .args(&["key1"])
        .assert()
        .failure()
        .stdout(is_empty());
}

#[test]
fn cli_malformed_put_line() {
    let temp_dir = TempDir::new().unwrap();
    let db = temp_dir.path().join("db");
    datastore("put", &db)
        .write_stdin("a\t1\nbad line\nc\t3\n")
        .assert()
        .failure()
        .code(1)
        .stderr(contains("bad line"));

    // 出错之前的记录已经写入，之后的没有
    datastore("get", &db)
        .args(&["a", "c"])
        .assert()
        .success()
        .stdout("a\t1\n");
}

#[test]
fn cli_value_keeps_later_delimiters() {
    let temp_dir = TempDir::new().unwrap();
    let db = temp_dir.path().join("db");
    datastore("put", &db)
        .write_stdin("key\tvalue\twith\ttabs\n")
        .assert()
        .success();
    datastore("get", &db)
        .args(&["key"])
        .assert()
        .success()
        .stdout("key\tvalue\twith\ttabs\n");
}

#[test]
fn cli_custom_delimiter() {
    let temp_dir = TempDir::new().unwrap();
    let db = temp_dir.path().join("db");
    datastore("put", &db)
        .args(&["-t", ","])
        .write_stdin("key1,value1\nkey2,value2\n")
        .assert()
        .success();
    datastore("dump", &db)
        .args(&["-t", ":"])
        .assert()
        .success()
        .stdout("key1:value1\nkey2:value2\n");
}

#[test]
fn cli_invalid_delimiter() {
    let temp_dir = TempDir::new().unwrap();
    let db = temp_dir.path().join("db");
    datastore("dump", &db)
        .args(&["-t", "::"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn cli_file_sources() {
    let temp_dir = TempDir::new().unwrap();
    let db = temp_dir.path().join("db");
    let pairs = temp_dir.path().join("pairs.tsv");
    let keys = temp_dir.path().join("keys.txt");
    fs::write(&pairs, "key1\tvalue1\nkey2\tvalue2\nkey3\tvalue3\n").unwrap();
    fs::write(&keys, "key1\nkey3\n").unwrap();

    datastore("put", &db).arg("-f").arg(&pairs).assert().success();
    datastore("delete", &db).arg("-f").arg(&keys).assert().success();
    datastore("dump", &db)
        .assert()
        .success()
        .stdout("key2\tvalue2\n");

    // -f 与位置参数不能同时出现
    datastore("get", &db)
        .arg("-f")
        .arg(&keys)
        .arg("key2")
        .assert()
        .failure();
}

#[test]
fn cli_missing_file_names_the_source() {
    let temp_dir = TempDir::new().unwrap();
    let db = temp_dir.path().join("db");
    datastore("put", &db)
        .args(&["-f", "no-such-file.tsv"])
        .assert()
        .failure()
        .stderr(contains("no-such-file.tsv"));
}

#[test]
fn cli_aliases() {
    let temp_dir = TempDir::new().unwrap();
    let db = temp_dir.path().join("db");
    datastore("insert", &db)
        .args(&["key1", "value1", "key2", "value2"])
        .assert()
        .success();
    datastore("rm", &db).args(&["key1"]).assert().success();
    datastore("select", &db)
        .args(&["key1", "key2"])
        .assert()
        .success()
        .stdout("key2\tvalue2\n");
}

#[test]
fn cli_db_from_env() {
    let temp_dir = TempDir::new().unwrap();
    let db = temp_dir.path().join("db");
    Command::cargo_bin("datastore")
        .unwrap()
        .env("DB_HOME", &db)
        .args(&["put", "key1", "value1"])
        .assert()
        .success();
    datastore("get", &db)
        .args(&["key1"])
        .assert()
        .success()
        .stdout("key1\tvalue1\n");
}

#[cfg(unix)]
#[test]
fn cli_invoked_by_operation_name() {
    let temp_dir = TempDir::new().unwrap();
    let db = temp_dir.path().join("db");
    let bin = assert_cmd::cargo::cargo_bin("datastore");
    for name in &["put", "get"] {
        std::os::unix::fs::symlink(&bin, temp_dir.path().join(name)).unwrap();
    }

    Command::new(temp_dir.path().join("put"))
        .env_remove("DB_HOME")
        .arg("-d")
        .arg(&db)
        .args(&["key1", "value1"])
        .assert()
        .success();
    Command::new(temp_dir.path().join("get"))
        .env_remove("DB_HOME")
        .arg("-d")
        .arg(&db)
        .arg("key1")
        .assert()
        .success()
        .stdout("key1\tvalue1\n");
}
