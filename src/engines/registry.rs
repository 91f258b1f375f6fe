//! Adapter dispatch by engine tag

use std::sync::Arc;

use crate::domain::engine::Engine;
use crate::engines::adapter::EngineAdapter;
use crate::engines::clickhouse::ClickhouseAdapter;
use crate::engines::file_based::{FileAdapter, FileFlavor};
use crate::engines::mongodb::MongodbAdapter;
use crate::engines::mysql::{MysqlAdapter, MysqlFlavor};
use crate::engines::postgres::PostgresAdapter;
use crate::engines::qdrant::QdrantAdapter;
use crate::engines::redis::{RedisAdapter, RedisFlavor};
use crate::infrastructure::process::ProcessManager;

/// Build the adapter implementing an engine's capability surface
pub fn adapter_for(engine: Engine, process: ProcessManager) -> Arc<dyn EngineAdapter> {
    match engine {
        Engine::Postgresql => Arc::new(PostgresAdapter::new(process)),
        Engine::Mysql => Arc::new(MysqlAdapter::new(MysqlFlavor::Mysql, process)),
        Engine::Mariadb => Arc::new(MysqlAdapter::new(MysqlFlavor::Mariadb, process)),
        Engine::Sqlite => Arc::new(FileAdapter::new(FileFlavor::Sqlite, process)),
        Engine::Duckdb => Arc::new(FileAdapter::new(FileFlavor::Duckdb, process)),
        Engine::Mongodb => Arc::new(MongodbAdapter::new(process)),
        Engine::Redis => Arc::new(RedisAdapter::new(RedisFlavor::Redis, process)),
        Engine::Valkey => Arc::new(RedisAdapter::new(RedisFlavor::Valkey, process)),
        Engine::Clickhouse => Arc::new(ClickhouseAdapter::new(process)),
        Engine::Qdrant => Arc::new(QdrantAdapter::new(process)),
    }
}
