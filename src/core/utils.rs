//! 核心工具函数

use sha2::{Digest, Sha256};
use std::any::Any;
use std::path::Path;

/// 从 panic 载荷中取出消息
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// 文件内容的 SHA-256 指纹（十六进制）
pub fn file_fingerprint(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let payload = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload = std::panic::catch_unwind(|| panic!("code {}", 7)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "code 7");
    }

    #[test]
    fn test_file_fingerprint_changes_with_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lib.bin");
        std::fs::write(&path, b"one").unwrap();
        let a = file_fingerprint(&path).unwrap();
        std::fs::write(&path, b"two").unwrap();
        let b = file_fingerprint(&path).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
    }
}
