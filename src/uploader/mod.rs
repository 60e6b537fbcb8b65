// 上传模块
//
// - chunk：分段切分、本地读取、上传游标
// - engine：小文件直传 / 会话分段上传
// - folder：下载产物扫描
// - sparse：已上传区域打洞回收

pub mod chunk;
pub mod engine;
pub mod folder;
pub mod sparse;

pub use chunk::{plan_chunks, read_range, UploadCursor};
pub use engine::ChunkedUploader;
pub use folder::{format_bytes, FolderScanner, ScannedFile};
pub use sparse::punch_hole;
