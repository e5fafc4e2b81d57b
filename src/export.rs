use std::fs;
use std::path::{Path, PathBuf};

use crate::error::StoreError;
use crate::result::ResultContainer;

/// Write every image of `record` into `directory`.
///
/// Files are named after the creation time and index; an existing file is
/// never overwritten. With `save_prompt` a `.txt` holding the prompt is
/// written next to each image.
pub fn save_images(directory: &Path, record: &ResultContainer, save_prompt: bool) -> Result<Vec<PathBuf>, StoreError> {
    fs::create_dir_all(directory)?;

    let stamp = record.created_at.format("%Y%m%d_%H%M%S_%3f").to_string();
    let mut written = Vec::with_capacity(record.images.len());
    for (index, image) in record.images.iter().enumerate() {
        let path = free_path(directory, &format!("{}_{}", stamp, index));
        fs::write(&path, image)?;
        if save_prompt {
            fs::write(path.with_extension("txt"), &record.prompt)?;
        }
        tracing::debug!("Saved image to {:?}", path);
        written.push(path);
    }
    Ok(written)
}

fn free_path(directory: &Path, stem: &str) -> PathBuf {
    let mut path = directory.join(format!("{}.png", stem));
    let mut suffix = 1;
    while path.exists() {
        path = directory.join(format!("{}-{}.png", stem, suffix));
        suffix += 1;
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestDescriptor;

    #[test]
    fn test_images_and_prompts_written() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("images");
        let mut record = ResultContainer::for_request(&RequestDescriptor::image("dall-e-3", "a red fox"));
        record.images = vec![vec![1], vec![2, 2]];

        let written = save_images(&out, &record, true).unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(fs::read(&written[1]).unwrap(), vec![2, 2]);
        assert_eq!(fs::read_to_string(written[0].with_extension("txt")).unwrap(), "a red fox");
    }

    #[test]
    fn test_prompt_file_optional() {
        let dir = tempfile::tempdir().unwrap();
        let mut record = ResultContainer::for_request(&RequestDescriptor::image("m", "p"));
        record.images = vec![vec![7]];

        let written = save_images(dir.path(), &record, false).unwrap();
        assert!(!written[0].with_extension("txt").exists());
    }

    #[test]
    fn test_same_timestamp_does_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = ResultContainer::for_request(&RequestDescriptor::image("m", "first"));
        first.images = vec![vec![1]];
        let mut second = first.clone();
        second.prompt = "second".to_string();
        second.images = vec![vec![2]];

        let a = save_images(dir.path(), &first, true).unwrap();
        let b = save_images(dir.path(), &second, true).unwrap();
        assert_ne!(a[0], b[0]);
        assert_eq!(fs::read(&a[0]).unwrap(), vec![1]);
        assert_eq!(fs::read(&b[0]).unwrap(), vec![2]);
        assert_eq!(fs::read_to_string(a[0].with_extension("txt")).unwrap(), "first");
        assert_eq!(fs::read_to_string(b[0].with_extension("txt")).unwrap(), "second");
    }
}
