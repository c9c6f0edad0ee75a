use failure::Fail;
use std::io;
use std::path::PathBuf;

/// datastore 错误类型.
#[derive(Debug, Fail)]
pub enum KvsError {
    /// IO 错误.
    #[fail(display = "{}", _0)]
    Io(#[cause] io::Error),
    /// 序列化与反序列化错误.
    #[fail(display = "{}", _0)]
    Serde(#[cause] serde_json::Error),
    /// SQLite 引擎错误.
    #[cfg(feature = "sqlite")]
    #[fail(display = "sqlite: {}", _0)]
    Sqlite(#[cause] rusqlite::Error),
    /// sled 引擎错误.
    #[cfg(feature = "btree")]
    #[fail(display = "sled: {}", _0)]
    Sled(#[cause] sled::Error),
    /// 只读打开时存储不存在.
    #[fail(display = "store not found: {:?}", _0)]
    NotFound(PathBuf),
    /// 向只读句柄写入.
    #[fail(display = "store is opened read-only")]
    ReadOnly,
    /// 句柄已关闭.
    #[fail(display = "store is closed")]
    Closed,
    /// put 输入行中没有分隔符.
    #[fail(display = "Cannot find delimiter in {:?}", line)]
    MissingDelimiter {
        /// 出错的输入行
        line: String,
    },
    /// 分隔符不是单字节.
    #[fail(display = "invalid delimiter {:?}: expected a single byte", _0)]
    InvalidDelimiter(String),
    /// 命令行参数错误.
    #[fail(display = "{}", _0)]
    Config(String),
    /// 读取某个输入源时发生的错误.
    #[fail(display = "{}: {}", name, cause)]
    Input {
        /// 输入源名称
        name: String,
        /// 原始错误
        cause: Box<KvsError>,
    },
    /// 日志中的记录类型与索引不符.
    #[fail(display = "Unexpected command type")]
    UnexpectedCommandType,
    /// 磁盘文件内容损坏.
    #[fail(display = "corrupted store: {}", _0)]
    Corrupted(String),
}

impl KvsError {
    /// 为错误附加输入源名称
    pub fn in_input(self, name: impl Into<String>) -> KvsError {
        KvsError::Input {
            name: name.into(),
            cause: Box::new(self),
        }
    }
}

impl From<io::Error> for KvsError {
    fn from(err: io::Error) -> KvsError {
        KvsError::Io(err)
    }
}

impl From<serde_json::Error> for KvsError {
    fn from(err: serde_json::Error) -> KvsError {
        KvsError::Serde(err)
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for KvsError {
    fn from(err: rusqlite::Error) -> KvsError {
        KvsError::Sqlite(err)
    }
}

#[cfg(feature = "btree")]
impl From<sled::Error> for KvsError {
    fn from(err: sled::Error) -> KvsError {
        KvsError::Sled(err)
    }
}

/// datastore 中的Result类型
pub type Result<T> = std::result::Result<T, KvsError>;
