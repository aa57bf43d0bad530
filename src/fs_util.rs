use std::fs;
use std::io::{self, Read, Write};

use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest, Sha256};
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::error::KiraError;

/// Zips every file under `source_dir` into `zip_path`, entries named relative
/// to `source_dir` with `/` separators and sorted for a stable layout.
pub fn archive_dir(source_dir: &Utf8Path, zip_path: &Utf8Path) -> Result<(), KiraError> {
    let mut files = Vec::new();
    collect_files(source_dir, &mut files)?;
    files.sort();

    if let Some(parent) = zip_path.parent() {
        fs::create_dir_all(parent).map_err(|err| KiraError::Archive(format!("{parent}: {err}")))?;
    }
    let file = fs::File::create(zip_path)
        .map_err(|err| KiraError::Archive(format!("create {zip_path}: {err}")))?;
    let mut writer = ZipWriter::new(file);
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for path in files {
        let relative = path
            .strip_prefix(source_dir)
            .map_err(|err| KiraError::Archive(err.to_string()))?;
        let name = relative
            .components()
            .map(|component| component.as_str())
            .collect::<Vec<_>>()
            .join("/");
        writer
            .start_file(name, options)
            .map_err(|err| KiraError::Archive(err.to_string()))?;
        let mut input =
            fs::File::open(&path).map_err(|err| KiraError::Archive(format!("{path}: {err}")))?;
        io::copy(&mut input, &mut writer).map_err(|err| KiraError::Archive(err.to_string()))?;
    }

    let mut file = writer
        .finish()
        .map_err(|err| KiraError::Archive(err.to_string()))?;
    file.flush()
        .map_err(|err| KiraError::Archive(err.to_string()))?;
    Ok(())
}

fn collect_files(dir: &Utf8Path, files: &mut Vec<Utf8PathBuf>) -> Result<(), KiraError> {
    let entries = fs::read_dir(dir).map_err(|err| KiraError::Archive(format!("{dir}: {err}")))?;
    for entry in entries {
        let entry = entry.map_err(|err| KiraError::Archive(err.to_string()))?;
        let path = Utf8PathBuf::from_path_buf(entry.path())
            .map_err(|path| KiraError::Archive(format!("non UTF-8 path {}", path.display())))?;
        if path.is_dir() {
            collect_files(&path, files)?;
        } else {
            files.push(path);
        }
    }
    Ok(())
}

/// Reads every entry of the archive to make sure it is complete, returning
/// the entry names.
pub fn validate_zip(zip_path: &Utf8Path) -> Result<Vec<String>, KiraError> {
    let file = fs::File::open(zip_path)
        .map_err(|err| KiraError::Archive(format!("open zip {zip_path}: {err}")))?;
    let mut archive = ZipArchive::new(file).map_err(|err| KiraError::Archive(err.to_string()))?;

    let mut names = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| KiraError::Archive(err.to_string()))?;
        names.push(entry.name().to_string());
        if entry.is_dir() {
            continue;
        }
        io::copy(&mut entry, &mut io::sink()).map_err(|err| KiraError::Archive(err.to_string()))?;
    }
    Ok(names)
}

/// Removes `dir` if present and creates it empty.
pub fn reset_dir(dir: &Utf8Path) -> Result<(), KiraError> {
    if dir.exists() {
        fs::remove_dir_all(dir).map_err(|err| KiraError::Filesystem(format!("{dir}: {err}")))?;
    }
    fs::create_dir_all(dir).map_err(|err| KiraError::Filesystem(format!("{dir}: {err}")))
}

/// Copies through a sibling temp file so readers never see a partial copy.
pub fn copy_file_atomic(source: &Utf8Path, destination: &Utf8Path) -> Result<u64, KiraError> {
    let parent = destination
        .parent()
        .ok_or_else(|| KiraError::Filesystem(format!("{destination} has no parent")))?;
    fs::create_dir_all(parent).map_err(|err| KiraError::Filesystem(format!("{parent}: {err}")))?;

    let mut input =
        fs::File::open(source).map_err(|err| KiraError::Filesystem(format!("{source}: {err}")))?;
    let mut temp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    let copied =
        io::copy(&mut input, &mut temp).map_err(|err| KiraError::Filesystem(err.to_string()))?;
    temp.persist(destination)
        .map_err(|err| KiraError::Filesystem(format!("{destination}: {}", err.error)))?;
    Ok(copied)
}

/// Lowercase hex SHA-256 of the file and its size in bytes.
pub fn sha256_file(path: &Utf8Path) -> Result<(String, u64), KiraError> {
    let mut file =
        fs::File::open(path).map_err(|err| KiraError::Filesystem(format!("{path}: {err}")))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let read = file
            .read(&mut buffer)
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        size += read as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_roundtrip_lists_relative_names() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let source = root.join("out");
        fs::create_dir_all(source.join("GSE1")).unwrap();
        fs::write(source.join("GSE1/GSE1.tsv"), "Gene\tGSM1\n").unwrap();
        fs::write(source.join("README.md"), "readme").unwrap();

        let zip_path = root.join("1.zip");
        archive_dir(&source, &zip_path).unwrap();
        let names = validate_zip(&zip_path).unwrap();
        assert_eq!(names, vec!["GSE1/GSE1.tsv", "README.md"]);
    }

    #[test]
    fn sha256_of_known_content() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("a.txt")).unwrap();
        fs::write(&path, "abc").unwrap();
        let (digest, size) = sha256_file(&path).unwrap();
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(size, 3);
    }
}
