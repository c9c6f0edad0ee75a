//! 该模块包含各个键值对存储引擎
//!
//! 每个引擎由一个cargo feature控制是否编译 (`sqlite`, `lsm`, `btree`)，
//! [`Engine`] 枚举列出当前编译进来的引擎，并负责按名称打开它们。

use crate::error::Result;
use slog::Logger;
use std::fmt;
use std::ops::Bound;
use std::path::Path;

/// 一条键值对记录
pub type KvPair = (Vec<u8>, Vec<u8>);

/// `dump` 返回的惰性、有序、只前进的记录序列
pub type Dump<'a> = Box<dyn Iterator<Item = Result<KvPair>> + 'a>;

/// 打开存储的方式
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    /// 只读：存储不存在时返回 `KvsError::NotFound`，不创建任何文件
    ReadOnly,
    /// 读写：存储不存在时创建
    ReadWrite,
}

impl Mode {
    /// 是否为只读模式
    pub fn is_read_only(self) -> bool {
        self == Mode::ReadOnly
    }
}

/// 闭区间键范围，两端均可省略
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyRange {
    /// 下界 (包含)
    pub lower: Option<Vec<u8>>,
    /// 上界 (包含)
    pub upper: Option<Vec<u8>>,
}

impl KeyRange {
    /// 覆盖整个键空间的范围
    pub fn all() -> KeyRange {
        KeyRange::default()
    }

    /// 由可选的上下界构造范围
    pub fn new(lower: Option<Vec<u8>>, upper: Option<Vec<u8>>) -> KeyRange {
        KeyRange { lower, upper }
    }

    /// 下界对应的 `Bound`，用于把游标定位到第一个不小于下界的键
    pub fn lower_bound(&self) -> Bound<Vec<u8>> {
        match &self.lower {
            Some(lower) => Bound::Included(lower.clone()),
            None => Bound::Unbounded,
        }
    }

    /// 键是否超过上界。游标按升序前进，一旦超过即可停止
    pub fn is_past_upper(&self, key: &[u8]) -> bool {
        match &self.upper {
            Some(upper) => key > upper.as_slice(),
            None => false,
        }
    }

    /// 键是否落在范围内
    pub fn contains(&self, key: &[u8]) -> bool {
        let above_lower = match &self.lower {
            Some(lower) => key >= lower.as_slice(),
            None => true,
        };
        above_lower && !self.is_past_upper(key)
    }
}

/// 键值对存储引擎特征
///
/// 键和值都是不透明的字节序列，所有引擎都按原始字节的字典序排列键。
pub trait KvsEngine {
    /// 插入或覆盖键值对
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

    /// 根据给定键返回对应值
    ///
    /// 若键不存在，则返回None
    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// 删除给定键
    ///
    /// 删除不存在的键不是错误
    fn delete(&mut self, key: &[u8]) -> Result<()>;

    /// 按键升序遍历 `range` 内的记录
    ///
    /// 返回的迭代器只能前进一次；需要重新遍历时再次调用 `dump`。
    fn dump(&mut self, range: &KeyRange) -> Result<Dump<'_>>;

    /// 释放引擎资源并把缓冲数据写入磁盘。重复调用无副作用
    fn close(&mut self) -> Result<()>;
}

#[cfg(feature = "lsm")]
mod lsm;
#[cfg(feature = "btree")]
mod sled;
#[cfg(feature = "sqlite")]
mod sqlite;

#[cfg(feature = "lsm")]
pub use self::lsm::LsmEngine;
#[cfg(feature = "btree")]
pub use self::sled::SledEngine;
#[cfg(feature = "sqlite")]
pub use self::sqlite::SqliteEngine;

/// 编译进来的存储引擎种类
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Engine {
    /// SQLite 引擎
    #[cfg(feature = "sqlite")]
    Sqlite,
    /// LSM 引擎
    #[cfg(feature = "lsm")]
    Lsm,
    /// sled B-tree 引擎
    #[cfg(feature = "btree")]
    Btree,
}

impl Engine {
    /// 所有编译进来的引擎，第一个为默认引擎
    pub const ALL: &'static [Engine] = &[
        #[cfg(feature = "sqlite")]
        Engine::Sqlite,
        #[cfg(feature = "lsm")]
        Engine::Lsm,
        #[cfg(feature = "btree")]
        Engine::Btree,
    ];

    /// 引擎名称
    pub fn name(self) -> &'static str {
        match self {
            #[cfg(feature = "sqlite")]
            Engine::Sqlite => "sqlite",
            #[cfg(feature = "lsm")]
            Engine::Lsm => "lsm",
            #[cfg(feature = "btree")]
            Engine::Btree => "btree",
        }
    }

    /// 根据名称查找引擎
    pub fn from_name(name: &str) -> Option<Engine> {
        Engine::ALL.iter().copied().find(|engine| engine.name() == name)
    }

    /// 默认引擎
    pub fn default_engine() -> Option<Engine> {
        Engine::ALL.first().copied()
    }

    /// 以给定模式打开位于 `path` 的存储
    pub fn open(self, path: &Path, mode: Mode, logger: &Logger) -> Result<Box<dyn KvsEngine>> {
        debug!(logger, "Opening store";
            "engine" => %self, "path" => %path.display(), "mode" => ?mode);
        match self {
            #[cfg(feature = "sqlite")]
            Engine::Sqlite => Ok(Box::new(SqliteEngine::open_with_logger(
                path,
                mode,
                logger.new(o!("engine" => "sqlite")),
            )?)),
            #[cfg(feature = "lsm")]
            Engine::Lsm => Ok(Box::new(LsmEngine::open_with_logger(
                path,
                mode,
                logger.new(o!("engine" => "lsm")),
            )?)),
            #[cfg(feature = "btree")]
            Engine::Btree => Ok(Box::new(SledEngine::open_with_logger(
                path,
                mode,
                logger.new(o!("engine" => "btree")),
            )?)),
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
