use crate::engines::{Dump, Engine, KeyRange, KvsEngine, Mode};
use crate::{KvsError, Result};
use slog::Logger;
use std::path::{Path, PathBuf};

/// 打开的存储句柄
struct Handle {
    path: PathBuf,
    mode: Mode,
    engine: Box<dyn KvsEngine>,
}

/// 某个引擎上的键值存储
///
/// `DataStore` 独占底层引擎句柄。再次 `open` 会先关闭之前的句柄；
/// `close` 可以重复调用；析构时自动关闭。
pub struct DataStore {
    engine: Engine,
    logger: Logger,
    handle: Option<Handle>,
}

impl DataStore {
    /// 生成一个尚未打开的 `DataStore`
    pub fn new(engine: Engine, logger: Logger) -> DataStore {
        DataStore {
            engine,
            logger,
            handle: None,
        }
    }

    /// 以给定模式打开 `path` 处的存储
    pub fn open_at(
        engine: Engine,
        path: impl AsRef<Path>,
        mode: Mode,
        logger: Logger,
    ) -> Result<DataStore> {
        let mut store = DataStore::new(engine, logger);
        store.open(path, mode)?;
        Ok(store)
    }

    /// 打开存储，已打开的句柄会先被关闭
    pub fn open(&mut self, path: impl AsRef<Path>, mode: Mode) -> Result<()> {
        self.close()?;
        let path = path.as_ref().to_path_buf();
        let engine = self.engine.open(&path, mode, &self.logger)?;
        info!(self.logger, "Opened store";
            "engine" => %self.engine, "path" => %path.display(), "mode" => ?mode);
        self.handle = Some(Handle { path, mode, engine });
        Ok(())
    }

    /// 关闭存储并释放引擎资源
    pub fn close(&mut self) -> Result<()> {
        if let Some(mut handle) = self.handle.take() {
            handle.engine.close()?;
            debug!(self.logger, "Closed store"; "path" => %handle.path.display());
        }
        Ok(())
    }

    /// 当前使用的引擎
    pub fn engine(&self) -> Engine {
        self.engine
    }

    /// 打开模式，未打开时为 None
    pub fn mode(&self) -> Option<Mode> {
        self.handle.as_ref().map(|handle| handle.mode)
    }

    /// 是否已打开
    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    fn handle(&mut self) -> Result<&mut Handle> {
        self.handle.as_mut().ok_or(KvsError::Closed)
    }

    fn writable(&mut self) -> Result<&mut dyn KvsEngine> {
        let handle = self.handle()?;
        if handle.mode.is_read_only() {
            return Err(KvsError::ReadOnly);
        }
        Ok(handle.engine.as_mut())
    }

    /// 插入或覆盖键值对
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.writable()?.put(key, value)
    }

    /// 返回键对应的值，键不存在时返回 None
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.handle()?.engine.get(key)
    }

    /// 删除键，键不存在时什么也不做
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.writable()?.delete(key)
    }

    /// 按键序遍历范围内的记录
    pub fn dump(&mut self, range: &KeyRange) -> Result<Dump<'_>> {
        self.handle()?.engine.dump(range)
    }
}

impl Drop for DataStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(self.logger, "Failed to close store: {}", e);
        }
    }
}
