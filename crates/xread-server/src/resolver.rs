//! Object name → local path.
//!
//! Names are relative to the configured root. Anything that could step
//! outside it (absolute paths, `..`, empty components) is refused.

use xread_core::error::{Result, XreadError};

use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone)]
pub struct FileResolver {
    root: PathBuf,
}

impl FileResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() {
            return Err(XreadError::InvalidArgument("empty filename"));
        }
        if name.contains('\0') {
            return Err(XreadError::InvalidArgument("filename contains NUL"));
        }
        let rel = Path::new(name);
        let mut path = self.root.clone();
        for component in rel.components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    return Err(XreadError::InvalidArgument("filename escapes root"))
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(XreadError::InvalidArgument("absolute filename"))
                }
            }
        }
        if path == self.root {
            return Err(XreadError::InvalidArgument("filename names the root"));
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve() {
        let r = FileResolver::new("/srv/data");
        assert_eq!(
            r.resolve("vol1/obj.bin").unwrap(),
            PathBuf::from("/srv/data/vol1/obj.bin")
        );
        assert_eq!(r.resolve("./a").unwrap(), PathBuf::from("/srv/data/a"));
        for bad in ["", "/etc/passwd", "../x", "a/../../b", ".", "a\0b"] {
            let err = r.resolve(bad).unwrap_err();
            assert_eq!(err.errno(), libc::EINVAL, "{:?}", bad);
        }
    }
}
