//! Interception Overhead Benchmarks
//!
//! Compares the bundled SQLite driver used directly against the same calls
//! routed through the guarded layer:
//! - Query and full cursor walk (every column read)
//! - Connection, statement and cursor lifecycle with no rows
//! - Single-row update through a prepared statement

use criterion::{black_box, criterion_group, criterion_main, Criterion};

#[cfg(feature = "sqlite")]
use dblint::driver::sqlite::SqliteDataSource;
#[cfg(feature = "sqlite")]
use dblint::driver::{
    Column, Connection, DataSource, PreparedStatement, ResultSet, Statement, StatementHandle, Value,
};
#[cfg(feature = "sqlite")]
use dblint::{GuardedDataSource, Policy};

#[cfg(feature = "sqlite")]
const ROWS: i64 = 100;
#[cfg(feature = "sqlite")]
const SELECT_ALL: &str = "SELECT id, name, age FROM users";

#[cfg(feature = "sqlite")]
fn create_bench_db(name: &str) -> std::path::PathBuf {
    let temp_file = std::env::temp_dir().join(format!("bench_interception_{name}.db"));
    let _ = std::fs::remove_file(&temp_file);

    {
        let conn = rusqlite::Connection::open(&temp_file).expect("Failed to create database");
        conn.execute("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, age INTEGER)", [])
            .expect("Failed to create table");
        for i in 1..=ROWS {
            conn.execute(
                "INSERT INTO users (name, age) VALUES (?1, ?2)",
                rusqlite::params![format!("User {i}"), i],
            )
            .expect("Failed to insert");
        }
    }

    temp_file
}

/// Policy with every check on and nothing to do when one fires
#[cfg(feature = "sqlite")]
fn quiet_policy() -> Policy {
    Policy::all_enabled().actions([]).build()
}

/// Same database, once unguarded and once behind the guarded layer
#[cfg(feature = "sqlite")]
fn open_pair(path: &std::path::Path) -> (SqliteDataSource, GuardedDataSource<SqliteDataSource>) {
    let raw = SqliteDataSource::open(path).expect("Failed to open database");
    let guarded = SqliteDataSource::open(path).expect("Failed to open database");
    (raw, GuardedDataSource::new(guarded, quiet_policy()))
}

#[cfg(feature = "sqlite")]
fn bench_select_walk(c: &mut Criterion) {
    let temp_file = create_bench_db("select");
    let (raw, guarded) = open_pair(&temp_file);

    let mut group = c.benchmark_group("select_walk");

    group.bench_function("raw", |b| {
        let mut conn = raw.get_connection().unwrap();
        b.iter(|| {
            let mut stmt = conn.create_statement().unwrap();
            let mut rs = stmt.execute_query(black_box(SELECT_ALL)).unwrap();
            let mut rows = 0;
            while rs.next().unwrap() {
                for index in 1..=3 {
                    black_box(rs.get(&Column::Index(index)).unwrap());
                }
                rows += 1;
            }
            rs.close().unwrap();
            stmt.close().unwrap();
            rows
        });
        conn.close().unwrap();
    });

    group.bench_function("guarded", |b| {
        let conn = guarded.get_connection().unwrap();
        b.iter(|| {
            let stmt = conn.create_statement().unwrap();
            let rs = stmt.execute_query(black_box(SELECT_ALL)).unwrap();
            let mut rows = 0;
            while rs.next().unwrap() {
                for index in 1..=3_usize {
                    black_box(rs.get(index).unwrap());
                }
                rows += 1;
            }
            rs.close().unwrap();
            stmt.close().unwrap();
            rows
        });
        conn.close().unwrap();
    });

    group.finish();
    let _ = std::fs::remove_file(&temp_file);
}

#[cfg(feature = "sqlite")]
fn bench_lifecycle(c: &mut Criterion) {
    let temp_file = create_bench_db("lifecycle");
    let (raw, guarded) = open_pair(&temp_file);

    let mut group = c.benchmark_group("lifecycle");

    group.bench_function("raw", |b| {
        b.iter(|| {
            let mut conn = raw.get_connection().unwrap();
            let mut stmt = conn.create_statement().unwrap();
            let mut rs = stmt.execute_query(black_box("SELECT 1 WHERE 0")).unwrap();
            assert!(!rs.next().unwrap());
            rs.close().unwrap();
            stmt.close().unwrap();
            conn.close().unwrap();
        });
    });

    group.bench_function("guarded", |b| {
        b.iter(|| {
            let conn = guarded.get_connection().unwrap();
            conn.set_read_only(true).unwrap();
            let stmt = conn.create_statement().unwrap();
            let rs = stmt.execute_query(black_box("SELECT 1 WHERE 0")).unwrap();
            assert!(!rs.next().unwrap());
            rs.close().unwrap();
            stmt.close().unwrap();
            conn.close().unwrap();
        });
    });

    group.finish();
    let _ = std::fs::remove_file(&temp_file);
}

#[cfg(feature = "sqlite")]
fn bench_prepared_update(c: &mut Criterion) {
    let temp_file = create_bench_db("update");
    let (raw, guarded) = open_pair(&temp_file);
    let sql = "UPDATE users SET age = age + 1 WHERE id = ?";

    let mut group = c.benchmark_group("prepared_update");

    group.bench_function("raw", |b| {
        let mut conn = raw.get_connection().unwrap();
        let mut stmt = conn.prepare_statement(sql).unwrap();
        b.iter(|| {
            stmt.bind(1, Value::from(black_box(7_i64))).unwrap();
            stmt.execute_update().unwrap()
        });
        stmt.close().unwrap();
        conn.close().unwrap();
    });

    group.bench_function("guarded", |b| {
        let conn = guarded.get_connection().unwrap();
        let stmt = conn.prepare_statement(sql).unwrap();
        b.iter(|| {
            stmt.bind(1, black_box(7_i64)).unwrap();
            stmt.execute_update().unwrap()
        });
        stmt.close().unwrap();
        conn.close().unwrap();
    });

    group.finish();
    let _ = std::fs::remove_file(&temp_file);
}

#[cfg(feature = "sqlite")]
criterion_group!(benches, bench_select_walk, bench_lifecycle, bench_prepared_update);

#[cfg(not(feature = "sqlite"))]
criterion_group!(benches,);

criterion_main!(benches);
