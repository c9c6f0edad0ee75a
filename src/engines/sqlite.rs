use super::{Dump, KeyRange, KvPair, KvsEngine, Mode};
use crate::{KvsError, Result};
use rusqlite::types::ValueRef;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension};
use slog::Logger;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

/// dump 游标每次从数据库取出的行数
const DUMP_PAGE_SIZE: usize = 256;

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS KeyValueDatabase(\
     xKey BLOB NOT NULL PRIMARY KEY ASC, xData BLOB NOT NULL)";
const TABLE_EXISTS: &str =
    "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = 'KeyValueDatabase'";
const PUT: &str = "INSERT OR REPLACE INTO KeyValueDatabase(xKey, xData) VALUES(?1, ?2)";
const GET: &str = "SELECT xData FROM KeyValueDatabase WHERE xKey = ?1";
const DELETE: &str = "DELETE FROM KeyValueDatabase WHERE xKey = ?1";

/// 以两列表 (xKey, xData) 保存键值对的 SQLite 引擎
///
/// put/get/delete 语句通过连接的语句缓存复用，同一条SQL在一个句柄内只编译一次。
pub struct SqliteEngine {
    path: PathBuf,
    conn: Option<Connection>,
    logger: Logger,
}

impl SqliteEngine {
    /// 打开位于 `path` 的 SQLite 数据库文件
    pub fn open(path: impl Into<PathBuf>, mode: Mode) -> Result<SqliteEngine> {
        SqliteEngine::open_with_logger(path, mode, Logger::root(slog::Discard, o!()))
    }

    /// 打开数据库文件，关闭失败等事件写入 `logger`
    ///
    /// 读写模式下文件和表不存在时会被创建；只读模式下二者缺一即返回 `KvsError::NotFound`。
    pub fn open_with_logger(
        path: impl Into<PathBuf>,
        mode: Mode,
        logger: Logger,
    ) -> Result<SqliteEngine> {
        let path = path.into();
        let conn = match mode {
            Mode::ReadOnly => {
                if !path.is_file() {
                    return Err(KvsError::NotFound(path));
                }
                let conn = Connection::open_with_flags(
                    &path,
                    OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )?;
                let tables: i64 = conn.query_row(TABLE_EXISTS, [], |row| row.get(0))?;
                if tables == 0 {
                    return Err(KvsError::NotFound(path));
                }
                conn
            }
            Mode::ReadWrite => {
                let conn = Connection::open(&path)?;
                conn.execute_batch(CREATE_TABLE)?;
                conn
            }
        };

        Ok(SqliteEngine {
            path,
            conn: Some(conn),
            logger,
        })
    }

    /// 数据库文件路径
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<&Connection> {
        self.conn.as_ref().ok_or(KvsError::Closed)
    }
}

impl KvsEngine for SqliteEngine {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut stmt = self.conn()?.prepare_cached(PUT)?;
        stmt.execute(params![key, value])?;
        Ok(())
    }

    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut stmt = self.conn()?.prepare_cached(GET)?;
        let value = stmt
            .query_row(params![key], |row| row.get_ref(0).map(column_bytes))
            .optional()?;
        value.transpose()
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        let mut stmt = self.conn()?.prepare_cached(DELETE)?;
        stmt.execute(params![key])?;
        Ok(())
    }

    fn dump(&mut self, range: &KeyRange) -> Result<Dump<'_>> {
        let conn = self.conn()?;
        Ok(Box::new(SqliteCursor::new(conn, range.clone())))
    }

    fn close(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.close().map_err(|(_, e)| KvsError::from(e))?;
            debug!(self.logger, "Closed sqlite database"; "path" => %self.path.display());
        }
        Ok(())
    }
}

impl Drop for SqliteEngine {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(self.logger, "Failed to close sqlite database: {}", e;
                "path" => %self.path.display());
        }
    }
}

/// 分页读取的 dump 游标
///
/// 每一页用 `xKey > last_key` 接着上一页继续查询，游标本身不跨页持有语句。
struct SqliteCursor<'a> {
    conn: &'a Connection,
    range: KeyRange,
    first_page: String,
    next_page: String,
    last_key: Option<Vec<u8>>,
    buffer: VecDeque<KvPair>,
    exhausted: bool,
}

impl<'a> SqliteCursor<'a> {
    fn new(conn: &'a Connection, range: KeyRange) -> SqliteCursor<'a> {
        let mut predicates = Vec::new();
        if range.lower.is_some() {
            predicates.push("xKey >= ?");
        }
        if range.upper.is_some() {
            predicates.push("xKey <= ?");
        }
        let first_page = select_sql(&predicates);
        predicates.push("xKey > ?");
        let next_page = select_sql(&predicates);

        SqliteCursor {
            conn,
            range,
            first_page,
            next_page,
            last_key: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    fn fetch_page(&mut self) -> Result<()> {
        let conn = self.conn;
        let sql = if self.last_key.is_some() {
            &self.next_page
        } else {
            &self.first_page
        };
        let mut stmt = conn.prepare_cached(sql)?;

        let mut bindings: Vec<&[u8]> = Vec::with_capacity(3);
        if let Some(lower) = &self.range.lower {
            bindings.push(lower);
        }
        if let Some(upper) = &self.range.upper {
            bindings.push(upper);
        }
        if let Some(last_key) = &self.last_key {
            bindings.push(last_key);
        }

        let mut rows = stmt.query(params_from_iter(bindings.iter()))?;
        let mut fetched = 0;
        while let Some(row) = rows.next()? {
            let key = column_bytes(row.get_ref(0)?)?;
            let value = column_bytes(row.get_ref(1)?)?;
            self.buffer.push_back((key, value));
            fetched += 1;
        }

        if fetched < DUMP_PAGE_SIZE {
            self.exhausted = true;
        }
        if let Some((key, _)) = self.buffer.back() {
            self.last_key = Some(key.clone());
        }
        Ok(())
    }
}

impl<'a> Iterator for SqliteCursor<'a> {
    type Item = Result<KvPair>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fetch_page() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

fn select_sql(predicates: &[&str]) -> String {
    let mut sql = String::from("SELECT xKey, xData FROM KeyValueDatabase");
    if !predicates.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&predicates.join(" AND "));
    }
    sql.push_str(&format!(" ORDER BY xKey LIMIT {}", DUMP_PAGE_SIZE));
    sql
}

/// 读取 BLOB 或 TEXT 列的原始字节
fn column_bytes(value: ValueRef<'_>) -> Result<Vec<u8>> {
    match value {
        ValueRef::Blob(bytes) | ValueRef::Text(bytes) => Ok(bytes.to_vec()),
        other => Err(KvsError::Corrupted(format!(
            "unexpected column type {}",
            other.data_type()
        ))),
    }
}
