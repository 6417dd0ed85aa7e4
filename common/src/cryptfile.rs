//! Encrypting and decrypting files with AES-256-CBC.
//!
//! Keys are the SHA-256 hash of a passphrase, used directly as AES-256 keys.
//!
//! File bodies are padded to whole cipher blocks with random bytes, so the
//! original size must be recoverable. It is stored unencrypted at the start
//! of the file: encrypting a near-known value (most files would store a
//! small, guessable length) would hand an attacker known plaintext. The
//! random per-file IV sits next to it, which also means encrypting the same
//! file twice yields entirely different output.
//!
//! File names are the opposite trade: listing operations must return the
//! same ciphertext for the same name on every call, so name encryption is
//! deterministic - a zero IV and PKCS#7 padding to a 32-byte boundary.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use anyhow::{ensure, Context, Result};
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::SyncError;

pub const KEY_LEN: usize = 32;

/// SHA-256 of a passphrase; fed directly to AES-256.
pub type HashedKey = [u8; KEY_LEN];

const BLOCK: usize = 16;
const NAME_BLOCK: usize = 32;
const SIZE_HEADER: usize = 8;
const CHUNK_SIZE: usize = 64 * 1024;
const ZERO_IV: [u8; BLOCK] = [0u8; BLOCK];

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

// standard base64 with '/' swapped for '-', keeping encrypted names safe in
// wire paths
static FILENAME_BASE64: std::sync::LazyLock<base64::engine::GeneralPurpose> =
    std::sync::LazyLock::new(|| {
        let alphabet = base64::alphabet::Alphabet::new(
            "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+-",
        )
        .expect("filename alphabet is well formed");
        base64::engine::GeneralPurpose::new(&alphabet, base64::engine::general_purpose::PAD)
    });

/// Hash a passphrase into a binary key.
pub fn hash_key(passphrase: &str) -> HashedKey {
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&Sha256::digest(passphrase.as_bytes()));
    key
}

fn encrypt_in_place(encryptor: &mut Aes256CbcEnc, buf: &mut [u8]) {
    for block in buf.chunks_exact_mut(BLOCK) {
        encryptor.encrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

fn decrypt_in_place(decryptor: &mut Aes256CbcDec, buf: &mut [u8]) {
    for block in buf.chunks_exact_mut(BLOCK) {
        decryptor.decrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

fn pad_name(mut data: Vec<u8>) -> Vec<u8> {
    let pad = NAME_BLOCK - data.len() % NAME_BLOCK;
    data.resize(data.len() + pad, pad as u8);
    data
}

fn unpad_name(data: &[u8]) -> Result<&[u8]> {
    let pad = *data.last().context("empty padded name")? as usize;
    ensure!(
        (1..=NAME_BLOCK).contains(&pad) && pad <= data.len(),
        "bad name padding"
    );
    let (name, padding) = data.split_at(data.len() - pad);
    ensure!(
        padding.iter().all(|&b| b as usize == pad),
        "bad name padding"
    );
    Ok(name)
}

/// Encrypt a file name. Deterministic: the same name and key always produce
/// the same ciphertext, so repeated listings agree.
pub fn encrypt_filename(key: &HashedKey, name: &str) -> String {
    let mut buf = pad_name(name.as_bytes().to_vec());
    let mut encryptor = Aes256CbcEnc::new(
        GenericArray::from_slice(key),
        GenericArray::from_slice(&ZERO_IV),
    );
    encrypt_in_place(&mut encryptor, &mut buf);
    FILENAME_BASE64.encode(&buf)
}

/// Reverse of [`encrypt_filename`].
pub fn decrypt_filename(key: &HashedKey, encoded: &str) -> Result<String> {
    let mut buf = FILENAME_BASE64
        .decode(encoded)
        .with_context(|| format!("failed decoding encrypted name {encoded:?}"))?;
    ensure!(
        !buf.is_empty() && buf.len() % BLOCK == 0,
        "encrypted name {encoded:?} has invalid length"
    );
    let mut decryptor = Aes256CbcDec::new(
        GenericArray::from_slice(key),
        GenericArray::from_slice(&ZERO_IV),
    );
    decrypt_in_place(&mut decryptor, &mut buf);
    let name = unpad_name(&buf).with_context(|| format!("failed decrypting name {encoded:?}"))?;
    String::from_utf8(name.to_vec()).context("decrypted name is not valid UTF-8")
}

/// Encrypt each path component, or pass them through when no key is set.
pub fn encrypt_path_items(key: Option<&HashedKey>, items: &[String]) -> Vec<String> {
    match key {
        Some(key) => items
            .iter()
            .map(|item| encrypt_filename(key, item))
            .collect(),
        None => items.to_vec(),
    }
}

/// Decrypt each path component, or pass them through when no key is set.
pub fn decrypt_path_items(key: Option<&HashedKey>, items: &[String]) -> Result<Vec<String>> {
    match key {
        Some(key) => items
            .iter()
            .map(|item| decrypt_filename(key, item))
            .collect(),
        None => Ok(items.to_vec()),
    }
}

/// Read the plaintext size stored in an encrypted file's header.
pub async fn file_plain_size(path: &std::path::Path) -> Result<u64> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("cannot open {path:?} for reading"))?;
    let mut header = [0u8; SIZE_HEADER];
    file.read_exact(&mut header)
        .await
        .map_err(|_| SyncError::CorruptFile(format!("{path:?} is missing its size header")))?;
    Ok(u64::from_le_bytes(header))
}

// like read_exact but tolerates EOF; fills as much of buf as the reader has
async fn read_full<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Encrypt a file. Randomized: a fresh IV per call and random final-block
/// padding mean the same input never encrypts to the same output twice.
pub async fn encrypt_file(
    key: &HashedKey,
    src: &std::path::Path,
    dst: &std::path::Path,
) -> Result<()> {
    let file = tokio::fs::File::open(src)
        .await
        .with_context(|| format!("cannot open {src:?} for reading"))?;
    let total = file
        .metadata()
        .await
        .with_context(|| format!("failed reading metadata from {src:?}"))?
        .len();
    let mut reader = tokio::io::BufReader::with_capacity(CHUNK_SIZE, file);
    let out = tokio::fs::File::create(dst)
        .await
        .with_context(|| format!("cannot open {dst:?} for writing"))?;
    let mut writer = tokio::io::BufWriter::with_capacity(CHUNK_SIZE, out);

    let mut iv = [0u8; BLOCK];
    rand::thread_rng().fill_bytes(&mut iv);
    let mut encryptor = Aes256CbcEnc::new(
        GenericArray::from_slice(key),
        GenericArray::from_slice(&iv),
    );
    writer.write_all(&total.to_le_bytes()).await?;
    writer.write_all(&iv).await?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut processed = 0u64;
    loop {
        let n = read_full(&mut reader, &mut buf)
            .await
            .with_context(|| format!("failed reading {src:?}"))?;
        if n == 0 {
            break;
        }
        processed += n as u64;
        let mut end = n;
        if n % BLOCK != 0 {
            // final partial block: pad with random bytes, not PKCS#7 - the
            // header already carries the real size
            end = n + BLOCK - n % BLOCK;
            rand::thread_rng().fill_bytes(&mut buf[n..end]);
        }
        encrypt_in_place(&mut encryptor, &mut buf[..end]);
        writer
            .write_all(&buf[..end])
            .await
            .with_context(|| format!("failed writing {dst:?}"))?;
        if n < CHUNK_SIZE {
            break;
        }
    }
    ensure!(
        processed == total,
        "{src:?} changed size while being encrypted"
    );
    writer.flush().await?;
    Ok(())
}

/// Decrypt a file, truncating the output to the size stored in the header.
pub async fn decrypt_file(
    key: &HashedKey,
    src: &std::path::Path,
    dst: &std::path::Path,
) -> Result<()> {
    let file = tokio::fs::File::open(src)
        .await
        .with_context(|| format!("cannot open {src:?} for reading"))?;
    let mut reader = tokio::io::BufReader::with_capacity(CHUNK_SIZE, file);
    let mut header = [0u8; SIZE_HEADER];
    reader
        .read_exact(&mut header)
        .await
        .map_err(|_| SyncError::CorruptFile(format!("{src:?} is missing its size header")))?;
    let orig_size = u64::from_le_bytes(header);
    let mut iv = [0u8; BLOCK];
    reader
        .read_exact(&mut iv)
        .await
        .map_err(|_| SyncError::CorruptFile(format!("{src:?} is missing its IV")))?;
    let mut decryptor = Aes256CbcDec::new(
        GenericArray::from_slice(key),
        GenericArray::from_slice(&iv),
    );

    let out = tokio::fs::File::create(dst)
        .await
        .with_context(|| format!("cannot open {dst:?} for writing"))?;
    let mut writer = tokio::io::BufWriter::with_capacity(CHUNK_SIZE, out);
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut written = 0u64;
    loop {
        let n = read_full(&mut reader, &mut buf)
            .await
            .with_context(|| format!("failed reading {src:?}"))?;
        if n == 0 {
            break;
        }
        if n % BLOCK != 0 {
            return Err(SyncError::CorruptFile(format!(
                "{src:?} ciphertext is not block aligned"
            ))
            .into());
        }
        decrypt_in_place(&mut decryptor, &mut buf[..n]);
        writer
            .write_all(&buf[..n])
            .await
            .with_context(|| format!("failed writing {dst:?}"))?;
        written += n as u64;
        if n < CHUNK_SIZE {
            break;
        }
    }
    if written < orig_size {
        return Err(SyncError::CorruptFile(format!(
            "{src:?} is truncated: {written} bytes decrypted, {orig_size} declared"
        ))
        .into());
    }
    writer.flush().await?;
    // drop the random padding
    writer.into_inner().set_len(orig_size).await?;
    Ok(())
}

/// Decrypt with one key and re-encrypt with another in a single streaming
/// pass. The original-size header field is carried over verbatim, so
/// re-cryption composes with later decryption exactly like a fresh
/// encryption would.
pub async fn recrypt_file(
    decrypt_key: &HashedKey,
    encrypt_key: &HashedKey,
    src: &std::path::Path,
    dst: &std::path::Path,
) -> Result<()> {
    let file = tokio::fs::File::open(src)
        .await
        .with_context(|| format!("cannot open {src:?} for reading"))?;
    let total = file
        .metadata()
        .await
        .with_context(|| format!("failed reading metadata from {src:?}"))?
        .len();
    let mut reader = tokio::io::BufReader::with_capacity(CHUNK_SIZE, file);
    let mut header = [0u8; SIZE_HEADER];
    reader
        .read_exact(&mut header)
        .await
        .map_err(|_| SyncError::CorruptFile(format!("{src:?} is missing its size header")))?;
    let orig_size = u64::from_le_bytes(header);
    let mut iv_in = [0u8; BLOCK];
    reader
        .read_exact(&mut iv_in)
        .await
        .map_err(|_| SyncError::CorruptFile(format!("{src:?} is missing its IV")))?;
    let ciphertext_len = total - (SIZE_HEADER + BLOCK) as u64;
    if ciphertext_len % BLOCK as u64 != 0 || ciphertext_len < orig_size {
        return Err(SyncError::CorruptFile(format!(
            "{src:?} is truncated: {ciphertext_len} ciphertext bytes, {orig_size} declared"
        ))
        .into());
    }
    let mut decryptor = Aes256CbcDec::new(
        GenericArray::from_slice(decrypt_key),
        GenericArray::from_slice(&iv_in),
    );

    let mut iv_out = [0u8; BLOCK];
    rand::thread_rng().fill_bytes(&mut iv_out);
    let mut encryptor = Aes256CbcEnc::new(
        GenericArray::from_slice(encrypt_key),
        GenericArray::from_slice(&iv_out),
    );
    let out = tokio::fs::File::create(dst)
        .await
        .with_context(|| format!("cannot open {dst:?} for writing"))?;
    let mut writer = tokio::io::BufWriter::with_capacity(CHUNK_SIZE, out);
    writer.write_all(&header).await?;
    writer.write_all(&iv_out).await?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = read_full(&mut reader, &mut buf)
            .await
            .with_context(|| format!("failed reading {src:?}"))?;
        if n == 0 {
            break;
        }
        if n % BLOCK != 0 {
            return Err(SyncError::CorruptFile(format!(
                "{src:?} ciphertext is not block aligned"
            ))
            .into());
        }
        decrypt_in_place(&mut decryptor, &mut buf[..n]);
        encrypt_in_place(&mut encryptor, &mut buf[..n]);
        writer
            .write_all(&buf[..n])
            .await
            .with_context(|| format!("failed writing {dst:?}"))?;
        if n < CHUNK_SIZE {
            break;
        }
    }
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key(tag: &str) -> HashedKey {
        hash_key(tag)
    }

    #[test]
    fn filename_roundtrip() {
        let key = test_key("secret");
        let long = "y".repeat(300);
        for name in ["a.txt", "hosszú-ékezetes-név.doc", "x", long.as_str()] {
            let encrypted = encrypt_filename(&key, name);
            assert_ne!(encrypted, name);
            assert!(!encrypted.contains('/'));
            assert_eq!(decrypt_filename(&key, &encrypted).unwrap(), name);
        }
    }

    #[test]
    fn filename_encryption_is_stable() {
        let key = test_key("secret");
        assert_eq!(
            encrypt_filename(&key, "stable.txt"),
            encrypt_filename(&key, "stable.txt")
        );
    }

    #[test]
    fn filename_wrong_key_fails_or_differs() {
        let key1 = test_key("one");
        let key2 = test_key("two");
        let encrypted = encrypt_filename(&key1, "name.txt");
        if let Ok(name) = decrypt_filename(&key2, &encrypted) {
            assert_ne!(name, "name.txt");
        }
    }

    async fn write_sample(dir: &std::path::Path, len: usize) -> std::path::PathBuf {
        let path = dir.join(format!("sample-{len}"));
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        tokio::fs::write(&path, &data).await.unwrap();
        path
    }

    #[tokio::test]
    async fn file_roundtrip_exact_length() {
        let dir = tempfile::tempdir().unwrap();
        let key = test_key("body");
        // exercise empty, sub-block, block aligned and multi-chunk sizes
        for len in [0usize, 5, 16, 31, 32, 4096, CHUNK_SIZE + 7] {
            let plain = write_sample(dir.path(), len).await;
            let encrypted = dir.path().join(format!("enc-{len}"));
            let decrypted = dir.path().join(format!("dec-{len}"));
            encrypt_file(&key, &plain, &encrypted).await.unwrap();
            assert_eq!(
                tokio::fs::metadata(&encrypted).await.unwrap().len(),
                (SIZE_HEADER + BLOCK) as u64 + len.div_ceil(BLOCK) as u64 * BLOCK as u64
            );
            assert_eq!(file_plain_size(&encrypted).await.unwrap(), len as u64);
            decrypt_file(&key, &encrypted, &decrypted).await.unwrap();
            assert_eq!(
                tokio::fs::read(&plain).await.unwrap(),
                tokio::fs::read(&decrypted).await.unwrap()
            );
        }
    }

    #[tokio::test]
    async fn encryption_is_randomized() {
        let dir = tempfile::tempdir().unwrap();
        let key = test_key("body");
        let plain = write_sample(dir.path(), 100).await;
        let enc1 = dir.path().join("enc1");
        let enc2 = dir.path().join("enc2");
        encrypt_file(&key, &plain, &enc1).await.unwrap();
        encrypt_file(&key, &plain, &enc2).await.unwrap();
        assert_ne!(
            tokio::fs::read(&enc1).await.unwrap(),
            tokio::fs::read(&enc2).await.unwrap()
        );
    }

    #[tokio::test]
    async fn recrypt_translates_between_keys() {
        let dir = tempfile::tempdir().unwrap();
        let key1 = test_key("first");
        let key2 = test_key("second");
        let plain = write_sample(dir.path(), 1000).await;
        let enc1 = dir.path().join("enc1");
        let enc2 = dir.path().join("enc2");
        let decrypted = dir.path().join("dec");
        encrypt_file(&key1, &plain, &enc1).await.unwrap();
        recrypt_file(&key1, &key2, &enc1, &enc2).await.unwrap();
        assert_eq!(file_plain_size(&enc2).await.unwrap(), 1000);
        decrypt_file(&key2, &enc2, &decrypted).await.unwrap();
        assert_eq!(
            tokio::fs::read(&plain).await.unwrap(),
            tokio::fs::read(&decrypted).await.unwrap()
        );
    }

    #[tokio::test]
    async fn truncated_file_is_reported_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let key = test_key("body");
        let plain = write_sample(dir.path(), 1000).await;
        let encrypted = dir.path().join("enc");
        encrypt_file(&key, &plain, &encrypted).await.unwrap();
        // chop off the final block
        let len = tokio::fs::metadata(&encrypted).await.unwrap().len();
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&encrypted)
            .await
            .unwrap();
        file.set_len(len - BLOCK as u64).await.unwrap();
        let decrypted = dir.path().join("dec");
        let err = decrypt_file(&key, &encrypted, &decrypted)
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<SyncError>().is_some(), "{err:#}");
        let recrypted = dir.path().join("rec");
        let err = recrypt_file(&key, &key, &encrypted, &recrypted)
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<SyncError>().is_some(), "{err:#}");
    }

    #[test]
    fn path_item_helpers() {
        let key = test_key("path");
        let items = vec!["a".to_string(), "b.txt".to_string()];
        let encrypted = encrypt_path_items(Some(&key), &items);
        assert_ne!(encrypted, items);
        assert_eq!(decrypt_path_items(Some(&key), &encrypted).unwrap(), items);
        assert_eq!(encrypt_path_items(None, &items), items);
    }
}
