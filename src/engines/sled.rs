use super::{Dump, KeyRange, KvsEngine, Mode};
use crate::{KvsError, Result};
use sled::{Db, Tree};
use slog::Logger;
use std::path::{Path, PathBuf};

/// 存放键值对的树名
const TREE_NAME: &str = "KeyValueDatabase";
/// sled 在数据库目录中创建的文件
const SLED_FILES: [&str; 2] = ["conf", "db"];

/// sled::Db包装
///
/// 所有操作都在同一棵具名树上进行，这棵树就是整个进程内共用的隐式事务上下文。
pub struct SledEngine {
    path: PathBuf,
    handle: Option<(Db, Tree)>,
    logger: Logger,
}

impl SledEngine {
    /// 打开位于 `path` 的 sled 数据库
    pub fn open(path: impl Into<PathBuf>, mode: Mode) -> Result<SledEngine> {
        SledEngine::open_with_logger(path, mode, Logger::root(slog::Discard, o!()))
    }

    /// 打开数据库，关闭失败等事件写入 `logger`
    ///
    /// 只读模式下目录不是 sled 数据库或键值树不存在时返回 `KvsError::NotFound`，
    /// 在确认之前不会调用 `sled::open`，因此不会写入任何文件。
    pub fn open_with_logger(
        path: impl Into<PathBuf>,
        mode: Mode,
        logger: Logger,
    ) -> Result<SledEngine> {
        let path = path.into();
        if mode.is_read_only() && !SLED_FILES.iter().all(|name| path.join(name).is_file()) {
            return Err(KvsError::NotFound(path));
        }

        let db = sled::open(&path)?;
        if mode.is_read_only() && !db.tree_names().iter().any(|name| &**name == TREE_NAME.as_bytes()) {
            return Err(KvsError::NotFound(path));
        }
        let tree = db.open_tree(TREE_NAME)?;

        Ok(SledEngine {
            path,
            handle: Some((db, tree)),
            logger,
        })
    }

    /// 数据库目录
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tree(&self) -> Result<&Tree> {
        self.handle
            .as_ref()
            .map(|(_, tree)| tree)
            .ok_or(KvsError::Closed)
    }
}

impl KvsEngine for SledEngine {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.tree()?.insert(key, value)?;
        Ok(())
    }

    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let res = self.tree()?.get(key)?;
        Ok(res.map(|ivec| ivec.to_vec()))
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.tree()?.remove(key)?;
        Ok(())
    }

    fn dump(&mut self, range: &KeyRange) -> Result<Dump<'_>> {
        let tree = self.tree()?;
        let iter = match &range.lower {
            Some(lower) => tree.range(lower.clone()..),
            None => tree.iter(),
        };
        let range = range.clone();
        let records = iter
            .map(|item| {
                item.map(|(key, value)| (key.to_vec(), value.to_vec()))
                    .map_err(KvsError::from)
            })
            .take_while(move |item| match item {
                Ok((key, _)) => !range.is_past_upper(key),
                Err(_) => true,
            });
        Ok(Box::new(records))
    }

    fn close(&mut self) -> Result<()> {
        if let Some((db, tree)) = self.handle.take() {
            tree.flush()?;
            db.flush()?;
            debug!(self.logger, "Closed sled database"; "path" => %self.path.display());
        }
        Ok(())
    }
}

impl Drop for SledEngine {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(self.logger, "Failed to flush sled database: {}", e;
                "path" => %self.path.display());
        }
    }
}
