use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use qore_adapters::{
    AdapterRuntime, AdapterSettings, CacheOptions, CacheState, EngineError, ExecuteArgs,
    LogicalColumn, LogicalType, MappingMode, MemorySource, Operator, PhysicalColumn,
    PhysicalSource, PhysicalSpec, Predicates, Qualifier, RowCursor, SourceAdapter,
    SourceDefinition, Value,
};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Connection};
use tempfile::tempdir;
use tokio::time::{sleep, timeout};

fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

async fn collect(cursor: &mut RowCursor) -> Vec<Vec<Value>> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    while cursor.fetch_next_row(&mut row).await.unwrap() {
        rows.push(row.clone());
    }
    rows
}

async fn wait_for_cache(adapter: &SourceAdapter, expected: fn(CacheState) -> bool) -> CacheState {
    timeout(Duration::from_secs(5), async {
        loop {
            let state = adapter.cache_state();
            if expected(state) {
                return state;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("cache never reached the expected state")
}

fn write_csv(path: &Path, content: &str) {
    fs::write(path, content).unwrap();
}

/// Pushes the mtime forward so a rewrite is seen on coarse-grained filesystems.
fn touch_forward(path: &Path, secs: u64) {
    let file = fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(secs))
        .unwrap();
}

fn people_columns() -> Vec<LogicalColumn> {
    vec![
        LogicalColumn::new("id", LogicalType::Integer),
        LogicalColumn::new("name", LogicalType::Text),
        LogicalColumn::new("score", LogicalType::Double),
    ]
}

#[tokio::test]
async fn missing_physical_column_projects_null() {
    let definition = SourceDefinition::new("LT0_DS0", "LT0", people_columns());
    let source = MemorySource::new(
        "mem://people",
        vec![
            PhysicalColumn::new("ID", "BIGINT"),
            PhysicalColumn::new("NAME", "VARCHAR"),
        ],
        vec![
            vec![Value::Int(1), text("ada")],
            vec![Value::Int(2), text("brian")],
        ],
    );
    let adapter = SourceAdapter::new(definition, Arc::new(source), AdapterSettings::default());

    let mut cursor = adapter
        .execute(&ExecuteArgs::default(), Predicates::none(), vec![0, 1, 2])
        .await
        .unwrap();
    assert_eq!(cursor.meta_data().len(), 3);
    assert_eq!(
        collect(&mut cursor).await,
        vec![
            vec![Value::Int(1), text("ada"), Value::Null],
            vec![Value::Int(2), text("brian"), Value::Null],
        ]
    );
    adapter.recycle_or_close(cursor).await;
}

#[tokio::test]
async fn positional_mapping_survives_renamed_columns() {
    let definition = SourceDefinition::new("LT0_DS0", "LT0", people_columns())
        .with_mapping_mode(MappingMode::ByPosition);
    let source = Arc::new(MemorySource::new(
        "mem://people",
        vec![
            PhysicalColumn::new("A", "BIGINT"),
            PhysicalColumn::new("B", "VARCHAR"),
            PhysicalColumn::new("C", "DOUBLE"),
        ],
        vec![vec![Value::Int(1), text("ada"), Value::Float(9.5)]],
    ));
    let adapter = SourceAdapter::new(definition.clone(), source.clone(), AdapterSettings::default());
    assert_eq!(adapter.reinitialise(definition.clone()).await.into_result().unwrap(), 1);

    source.replace_rows(
        vec![
            PhysicalColumn::new("col_x", "BIGINT"),
            PhysicalColumn::new("col_y", "VARCHAR"),
            PhysicalColumn::new("col_z", "DOUBLE"),
        ],
        vec![vec![Value::Int(2), text("brian"), Value::Float(7.0)]],
    );
    let outcome = adapter.reinitialise(definition).await;
    assert!(outcome.is_new_generation());

    let mut cursor = adapter
        .execute(&ExecuteArgs::default(), Predicates::none(), vec![0, 1, 2])
        .await
        .unwrap();
    assert_eq!(
        collect(&mut cursor).await,
        vec![vec![Value::Int(2), text("brian"), Value::Float(7.0)]]
    );
}

#[tokio::test]
async fn open_cursors_keep_their_generation() {
    let definition = SourceDefinition::new("LT0_DS0", "LT0", people_columns());
    let source = Arc::new(MemorySource::new(
        "mem://people",
        vec![
            PhysicalColumn::new("ID", "BIGINT"),
            PhysicalColumn::new("NAME", "VARCHAR"),
        ],
        vec![vec![Value::Int(1), text("ada")]],
    ));
    let adapter = SourceAdapter::new(definition, source.clone(), AdapterSettings::default());

    let mut before = adapter
        .execute(&ExecuteArgs::default(), Predicates::none(), vec![0, 1])
        .await
        .unwrap();

    // Same logical columns, physically reordered
    source.replace_rows(
        vec![
            PhysicalColumn::new("NAME", "VARCHAR"),
            PhysicalColumn::new("ID", "BIGINT"),
        ],
        vec![vec![text("brian"), Value::Int(2)]],
    );
    let mut after = adapter
        .execute(&ExecuteArgs::default(), Predicates::none(), vec![0, 1])
        .await
        .unwrap();

    assert_eq!(before.node_state().generation, 1);
    assert_eq!(after.node_state().generation, 2);
    assert_eq!(
        collect(&mut before).await,
        vec![vec![Value::Int(1), text("ada"), Value::Null]]
    );
    assert_eq!(
        collect(&mut after).await,
        vec![vec![Value::Int(2), text("brian"), Value::Null]]
    );
}

#[tokio::test]
async fn concurrent_executes_share_one_refresh() {
    let definition = SourceDefinition::new("LT0_DS0", "LT0", people_columns());
    let source = Arc::new(MemorySource::new(
        "mem://people",
        vec![PhysicalColumn::new("ID", "BIGINT")],
        vec![vec![Value::Int(1)]],
    ));
    let adapter = SourceAdapter::new(definition, source.clone(), AdapterSettings::default());
    adapter.ensure_initialised().await.unwrap();

    source.replace_rows(
        vec![PhysicalColumn::new("ID", "BIGINT")],
        vec![vec![Value::Int(1)], vec![Value::Int(2)]],
    );

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let adapter = adapter.clone();
            tokio::spawn(async move {
                let mut cursor = adapter
                    .execute(&ExecuteArgs::default(), Predicates::none(), vec![0])
                    .await
                    .unwrap();
                let generation = cursor.node_state().generation;
                (generation, collect(&mut cursor).await.len())
            })
        })
        .collect();

    for task in tasks {
        assert_eq!(task.await.unwrap(), (2, 2));
    }
    assert_eq!(adapter.state().generation, 2);
}

#[tokio::test]
async fn rewritten_file_is_picked_up() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("people.csv");
    write_csv(&path, "id,name\n1,ada\n2,brian\n");

    let runtime = AdapterRuntime::default();
    let definition = SourceDefinition::new("LT0_DS0", "LT0", people_columns()).with_physical(
        PhysicalSpec::File {
            path: path.to_string_lossy().to_string(),
            delimiter: ',',
        },
    );
    let adapter = runtime.register_definition(definition).await.unwrap();

    let mut cursor = adapter
        .execute(&ExecuteArgs::default(), Predicates::none(), vec![0, 1, 2])
        .await
        .unwrap();
    assert_eq!(collect(&mut cursor).await.len(), 2);
    adapter.recycle_or_close(cursor).await;

    write_csv(&path, "score,name,id\n1.5,cleo,3\n");
    touch_forward(&path, 5);

    let mut cursor = adapter
        .execute(&ExecuteArgs::default(), Predicates::none(), vec![0, 1, 2])
        .await
        .unwrap();
    assert_eq!(
        collect(&mut cursor).await,
        vec![vec![Value::Int(3), text("cleo"), Value::Float(1.5)]]
    );
    assert_eq!(adapter.state().generation, 2);
    runtime.shutdown().await;
}

#[tokio::test]
async fn reader_of_a_superseded_generation_is_not_reused() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("people.csv");
    write_csv(&path, "id,name\n1,ada\n2,brian\n");

    let runtime = AdapterRuntime::default();
    let definition = SourceDefinition::new("LT0_DS0", "LT0", people_columns()).with_physical(
        PhysicalSpec::File {
            path: path.to_string_lossy().to_string(),
            delimiter: ',',
        },
    );
    let adapter = runtime.register_definition(definition).await.unwrap();

    let mut first = adapter
        .execute(&ExecuteArgs::default(), Predicates::none(), vec![0, 1, 2])
        .await
        .unwrap();
    assert_eq!(collect(&mut first).await.len(), 2);

    write_csv(&path, "score,name,id\n1.5,cleo,3\n4.5,dora,4\n");
    touch_forward(&path, 5);

    let expected = vec![
        vec![Value::Int(3), text("cleo"), Value::Float(1.5)],
        vec![Value::Int(4), text("dora"), Value::Float(4.5)],
    ];
    let mut second = adapter
        .execute(&ExecuteArgs::default(), Predicates::none(), vec![0, 1, 2])
        .await
        .unwrap();
    assert_eq!(second.node_state().generation, 2);
    assert_eq!(collect(&mut second).await, expected);

    // Finishes after the refresh; its reader must not reach the pool
    adapter.recycle_or_close(first).await;
    adapter.recycle_or_close(second).await;

    for _ in 0..2 {
        let mut cursor = adapter
            .execute(&ExecuteArgs::default(), Predicates::none(), vec![0, 1, 2])
            .await
            .unwrap();
        assert_eq!(cursor.node_state().generation, 2);
        assert_eq!(collect(&mut cursor).await, expected);
        adapter.recycle_or_close(cursor).await;
    }
    runtime.shutdown().await;
}

#[tokio::test]
async fn rewritten_cached_file_reloads_under_new_layout() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("people.csv");
    write_csv(&path, "id,name,score\n1,ada,1.5\n2,brian,2.5\n");

    let runtime = AdapterRuntime::default();
    let definition = SourceDefinition::new("LT0_DS0", "LT0", people_columns())
        .with_cache(CacheOptions {
            enabled: true,
            ttl_secs: None,
            indexes: vec!["id".into()],
        })
        .with_physical(PhysicalSpec::File {
            path: path.to_string_lossy().to_string(),
            delimiter: ',',
        });
    let adapter = runtime.register_definition(definition).await.unwrap();
    wait_for_cache(&adapter, |s| matches!(s, CacheState::Cached { .. })).await;
    let cached_generation = adapter.state().generation;

    // Same logical columns, physically permuted, different rows
    write_csv(&path, "name,id\ncleo,3\ndora,4\nerin,5\n");
    touch_forward(&path, 5);

    let by_id = |id: i64| Predicates::none().and(Qualifier::new(0, Operator::Equals, Value::Int(id)));
    let mut direct = adapter
        .execute(&ExecuteArgs::default(), by_id(4), vec![0, 1])
        .await
        .unwrap();
    assert!(!direct.is_from_cache());
    assert!(direct.node_state().generation > cached_generation);
    assert_eq!(
        collect(&mut direct).await,
        vec![vec![Value::Int(4), text("dora"), Value::Null]]
    );
    adapter.recycle_or_close(direct).await;

    wait_for_cache(&adapter, |s| matches!(s, CacheState::Cached { .. })).await;
    let state = adapter.state();
    let cache = state.cache.clone().unwrap();
    assert_eq!(cache.len(), 3);
    assert_eq!(cache.index(0).unwrap().key_count(), 3);

    let mut cached = adapter
        .execute(&ExecuteArgs::default(), by_id(5), vec![0, 1])
        .await
        .unwrap();
    assert!(cached.is_from_cache());
    assert_eq!(cached.node_state().generation, state.generation);
    assert_eq!(
        collect(&mut cached).await,
        vec![vec![Value::Int(5), text("erin"), Value::Null]]
    );
    runtime.shutdown().await;
}

#[tokio::test]
async fn cached_file_answers_from_index() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("people.csv");
    let mut content = String::from("id,name,score\n");
    for i in 0..20 {
        content.push_str(&format!("{},name{},{}.5\n", i, i, i));
    }
    write_csv(&path, &content);

    let runtime = AdapterRuntime::default();
    let definition = SourceDefinition::new("LT0_DS0", "LT0", people_columns())
        .with_cache(CacheOptions {
            enabled: true,
            ttl_secs: None,
            indexes: vec!["id".into()],
        })
        .with_physical(PhysicalSpec::File {
            path: path.to_string_lossy().to_string(),
            delimiter: ',',
        });
    let adapter = runtime.register_definition(definition).await.unwrap();
    wait_for_cache(&adapter, |s| matches!(s, CacheState::Cached { .. })).await;

    let cache = adapter.state().cache.clone().unwrap();
    assert_eq!(cache.len(), 20);
    assert_eq!(cache.index(0).unwrap().key_count(), 20);

    let predicates = Predicates::none()
        .and(Qualifier::new(0, Operator::Equals, Value::Int(7)))
        .and(Qualifier::new(2, Operator::GreaterThan, Value::Float(1.0)));
    let mut cursor = adapter
        .execute(&ExecuteArgs::default(), predicates, vec![1])
        .await
        .unwrap();
    assert!(cursor.is_from_cache());
    assert_eq!(
        collect(&mut cursor).await,
        vec![vec![Value::Null, text("name7"), Value::Null]]
    );

    let mut count = adapter
        .execute(&ExecuteArgs::default(), Predicates::none(), vec![])
        .await
        .unwrap();
    assert_eq!(count.row_count().await.unwrap(), 20);
    runtime.shutdown().await;
}

#[tokio::test]
async fn failed_cache_load_is_retried_by_sweep() {
    let runtime = AdapterRuntime::default();
    let source = Arc::new(MemorySource::new(
        "mem://people",
        vec![PhysicalColumn::new("ID", "BIGINT")],
        vec![vec![Value::Int(1)], vec![Value::Int(2)]],
    ));
    source.set_offline(true);

    let definition = SourceDefinition::new("LT0_DS0", "LT0", people_columns()).with_cache(
        CacheOptions {
            enabled: true,
            ..CacheOptions::default()
        },
    );
    let adapter = runtime
        .register(definition, source.clone() as Arc<dyn PhysicalSource>)
        .await;
    wait_for_cache(&adapter, |s| s == CacheState::Failed).await;

    let err = adapter
        .execute(&ExecuteArgs::default(), Predicates::none(), vec![0])
        .await
        .unwrap_err();
    assert!(err.is_connection_failure());

    source.set_offline(false);
    assert_eq!(runtime.adapters().sweep_caches(), 1);
    wait_for_cache(&adapter, |s| matches!(s, CacheState::Cached { .. })).await;
    assert_eq!(adapter.state().cache.as_ref().unwrap().len(), 2);
    runtime.shutdown().await;
}

#[tokio::test]
async fn pluralized_file_reads_named_instances() {
    let dir = tempdir().unwrap();
    write_csv(&dir.path().join("sales_2023.csv"), "id;name\n1;ada\n");
    write_csv(&dir.path().join("sales_2024.csv"), "id;name\n2;brian\n3;cleo\n");
    write_csv(&dir.path().join("other.csv"), "id;name\n9;zed\n");

    let runtime = AdapterRuntime::default();
    let mask = dir.path().join("sales_*.csv").to_string_lossy().to_string();
    let definition = SourceDefinition::new("LT0_DS0", "LT0", people_columns())
        .with_cache(CacheOptions {
            enabled: true,
            ..CacheOptions::default()
        })
        .with_physical(PhysicalSpec::File {
            path: mask.clone(),
            delimiter: ';',
        });
    let adapter = runtime.register_definition(definition).await.unwrap();
    assert_eq!(adapter.cache_state(), CacheState::NoCache);

    let instances = adapter.pluralized_instances().await.unwrap();
    assert_eq!(instances.len(), 2);
    assert!(instances[0].ends_with("sales_2023.csv"));
    assert!(adapter.is_based_on(&instances[1]));
    assert!(!adapter.is_based_on(&dir.path().join("other.csv").to_string_lossy()));

    let err = adapter
        .execute(&ExecuteArgs::default(), Predicates::none(), vec![0])
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Configuration { .. }));

    let mut cursor = adapter
        .execute(&ExecuteArgs::instance(instances[1].as_str()), Predicates::none(), vec![0, 1])
        .await
        .unwrap();
    assert_eq!(
        collect(&mut cursor).await,
        vec![
            vec![Value::Int(2), text("brian"), Value::Null],
            vec![Value::Int(3), text("cleo"), Value::Null],
        ]
    );
    runtime.shutdown().await;
}

#[tokio::test]
async fn nested_adapter_reads_through_child() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("people.csv");
    write_csv(&path, "id,name\n1,ada\n2,brian\n");

    let runtime = AdapterRuntime::default();
    let base = SourceDefinition::new("LT0_DS0", "LT0", people_columns()).with_physical(
        PhysicalSpec::File {
            path: path.to_string_lossy().to_string(),
            delimiter: ',',
        },
    );
    runtime.register_definition(base).await.unwrap();

    let layered = SourceDefinition::new(
        "LT1_DS0",
        "LT1",
        vec![LogicalColumn::new("name", LogicalType::Text)],
    )
    .with_physical(PhysicalSpec::Nested {
        adapter: "LT0_DS0".to_string(),
    });
    let adapter = runtime.register_definition(layered).await.unwrap();
    assert!(adapter.is_based_on(&path.to_string_lossy()));

    let mut cursor = adapter
        .execute(&ExecuteArgs::default(), Predicates::none(), vec![0])
        .await
        .unwrap();
    assert_eq!(collect(&mut cursor).await, vec![vec![text("ada")], vec![text("brian")]]);
    adapter.recycle_or_close(cursor).await;
    runtime.shutdown().await;
}

#[tokio::test]
async fn runtime_loads_config_file() {
    let dir = tempdir().unwrap();
    let data = dir.path().join("data.csv");
    write_csv(&data, "id\n1\n2\n3\n");
    let config = dir.path().join("adapters.json");
    let body = serde_json::json!({
        "settings": { "max_pool_size": 2 },
        "sources": [{
            "id": "LT0_DS0",
            "logical_table": "LT0",
            "columns": [{ "name": "id", "logical_type": "integer" }],
            "physical": { "kind": "file", "path": data.to_string_lossy() }
        }]
    });
    fs::write(&config, serde_json::to_string_pretty(&body).unwrap()).unwrap();

    let runtime = AdapterRuntime::from_config_file(&config).await.unwrap();
    assert_eq!(runtime.settings().max_pool_size, 2);
    let adapter = runtime.adapter("LT0_DS0").unwrap();
    let predicates = Predicates::none().and(Qualifier::new(0, Operator::GreaterOrEquals, Value::Int(2)));
    let mut cursor = adapter
        .execute(&ExecuteArgs::default(), predicates, vec![0])
        .await
        .unwrap();
    assert_eq!(collect(&mut cursor).await, vec![vec![Value::Int(2)], vec![Value::Int(3)]]);
    assert!(matches!(
        runtime.adapter("nope").unwrap_err(),
        EngineError::SourceNotFound { .. }
    ));
    runtime.shutdown().await;
}

async fn seed_sqlite(path: &Path) {
    let mut conn = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .connect()
        .await
        .unwrap();
    sqlx::query("CREATE TABLE orders (id INTEGER NOT NULL, label TEXT, qty INTEGER, price REAL)")
        .execute(&mut conn)
        .await
        .unwrap();
    sqlx::query(
        "INSERT INTO orders VALUES (1, 'pen', 1, 1.5), (2, 'ink', 4, 12.0), (3, 'pad', 2, NULL)",
    )
    .execute(&mut conn)
    .await
    .unwrap();
    conn.close().await.unwrap();
}

#[tokio::test]
async fn sqlite_table_end_to_end() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("shop.db");
    seed_sqlite(&db).await;

    let runtime = AdapterRuntime::default();
    let definition = SourceDefinition::new(
        "LT2_DS0",
        "LT2",
        vec![
            LogicalColumn::new("id", LogicalType::Integer),
            LogicalColumn::new("label", LogicalType::Text),
            LogicalColumn::new("price", LogicalType::Double),
            LogicalColumn::new("discount", LogicalType::Double),
        ],
    )
    .with_physical(PhysicalSpec::Relational {
        url: format!("sqlite://{}", db.display()),
        table: "orders".to_string(),
    });
    let adapter = runtime.register_definition(definition).await.unwrap();
    assert!(adapter.is_based_on("ORDERS"));

    let args = ExecuteArgs::default().with_pushed_where("qty > 1");
    let mut cursor = adapter
        .execute(&args, Predicates::none(), vec![0, 1, 2, 3])
        .await
        .unwrap();
    assert_eq!(
        collect(&mut cursor).await,
        vec![
            vec![Value::Int(2), text("ink"), Value::Float(12.0), Value::Null],
            vec![Value::Int(3), text("pad"), Value::Null, Value::Null],
        ]
    );
    adapter.recycle_or_close(cursor).await;

    let mut count = adapter
        .execute(&ExecuteArgs::default(), Predicates::none(), vec![])
        .await
        .unwrap();
    assert_eq!(count.row_count().await.unwrap(), 3);

    let predicates = Predicates::none().and(Qualifier::new(1, Operator::Equals, text("pen")));
    let mut cursor = adapter
        .execute(&ExecuteArgs::default(), predicates, vec![0])
        .await
        .unwrap();
    assert_eq!(
        collect(&mut cursor).await,
        vec![vec![Value::Int(1), Value::Null, Value::Null, Value::Null]]
    );
    runtime.shutdown().await;
}

#[tokio::test]
async fn sqlite_bad_pushdown_surfaces_error() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("shop.db");
    seed_sqlite(&db).await;

    let runtime = AdapterRuntime::default();
    let definition = SourceDefinition::new(
        "LT2_DS0",
        "LT2",
        vec![LogicalColumn::new("id", LogicalType::Integer)],
    )
    .with_physical(PhysicalSpec::Relational {
        url: format!("sqlite://{}", db.display()),
        table: "orders".to_string(),
    });
    let adapter = runtime.register_definition(definition).await.unwrap();

    let args = ExecuteArgs::default().with_pushed_where("no_such_column = 1");
    let mut cursor = adapter
        .execute(&args, Predicates::none(), vec![0])
        .await
        .unwrap();
    let mut row = Vec::new();
    assert!(cursor.fetch_next_row(&mut row).await.is_err());
    runtime.shutdown().await;
}
