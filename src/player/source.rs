use crate::core::{PlayerError, Result, StreamProtocol, TrackFormat};
use crate::player::track::MediaTrack;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::sync::Arc;

/// 文件句柄 + 字节区间形式的数据源
///
/// 句柄共享（`Arc<File>`），挂起/恢复期间保留同一个句柄。
#[derive(Clone)]
pub struct FileSource {
    file: Arc<File>,
    offset: u64,
    length: u64,
}

impl FileSource {
    /// 创建并校验；`length` 超出文件剩余部分时截断
    pub fn new(file: File, offset: u64, length: u64) -> Result<Self> {
        let mut source = Self {
            file: Arc::new(file),
            offset,
            length,
        };
        source.init_check()?;
        Ok(source)
    }

    /// 句柄级校验：必须是普通文件，偏移在文件范围内
    fn init_check(&mut self) -> Result<()> {
        let meta = self
            .file
            .metadata()
            .map_err(|e| PlayerError::UnknownSource(format!("文件句柄无效: {}", e)))?;
        if !meta.is_file() {
            return Err(PlayerError::UnknownSource("文件句柄不是普通文件".to_string()));
        }
        let size = meta.len();
        if self.offset > size {
            return Err(PlayerError::UnknownSource(format!(
                "偏移 {} 超出文件大小 {}",
                self.offset, size
            )));
        }
        self.length = self.length.min(size - self.offset);
        Ok(())
    }

    pub fn file(&self) -> &Arc<File> {
        &self.file
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u64 {
        self.length
    }
}

impl fmt::Debug for FileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSource")
            .field("offset", &self.offset)
            .field("length", &self.length)
            .finish()
    }
}

/// 数据源描述符：定位符 + 请求头，或文件句柄
#[derive(Debug, Clone)]
pub enum DataSource {
    Uri {
        uri: String,
        headers: HashMap<String, String>,
    },
    File(FileSource),
}

impl DataSource {
    pub fn uri(uri: impl Into<String>) -> Self {
        DataSource::Uri {
            uri: uri.into(),
            headers: HashMap::new(),
        }
    }

    pub fn protocol(&self) -> Option<StreamProtocol> {
        match self {
            DataSource::Uri { uri, .. } => StreamProtocol::from_locator(uri),
            DataSource::File(_) => None,
        }
    }

    /// 描述（日志使用，不包含请求头）
    pub fn description(&self) -> String {
        match self {
            DataSource::Uri { uri, .. } => uri.clone(),
            DataSource::File(file) => format!("fd[{}+{}]", file.offset(), file.length()),
        }
    }
}

/// 解封装器：把一个数据源拆成若干条基本流
pub trait MediaExtractor: Send {
    fn count_tracks(&self) -> usize;

    fn track_format(&self, index: usize) -> Option<TrackFormat>;

    /// 取得第 `index` 条轨道的解码管线，每条轨道独立成败
    fn get_track(&mut self, index: usize) -> Result<Box<dyn MediaTrack>>;

    /// 数据源是否需要预读缓冲（通常是网络源）
    fn wants_prefetching(&self) -> bool {
        false
    }
}

/// 解封装器工厂
///
/// 打不开数据源返回 `UnknownSource`，认不出容器返回 `UnknownFormat`。
pub trait ExtractorFactory: Send + Sync {
    fn open(&self, source: &DataSource) -> Result<Box<dyn MediaExtractor>>;
}
