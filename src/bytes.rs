use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, ErrorKind, Write};
use std::path::{Path, PathBuf};

use arboard::Clipboard;
use log::debug;

use crate::error::{Result, TransferError};
use crate::utils::FileMetadata;
use crate::MAX_PAYLOAD_SIZE;

/// Load the whole file at `path` plus the metadata that travels with it.
///
/// Files that could not fit in a single frame once sealed are refused before
/// anything is read.
pub fn read_payload(path: &Path) -> Result<(FileMetadata, Vec<u8>)> {
    if !path.is_file() {
        return Err(TransferError::Io(io::Error::new(
            ErrorKind::NotFound,
            format!("not a readable file: {}", path.display()),
        )));
    }

    let size = fs::metadata(path)?.len();
    if size > MAX_PAYLOAD_SIZE as u64 {
        return Err(TransferError::PayloadTooLarge {
            size,
            limit: MAX_PAYLOAD_SIZE,
        });
    }

    let contents = fs::read(path)?;
    let metadata = FileMetadata::from_path(path);
    debug!(
        "Read {} bytes from {} ({})",
        contents.len(),
        path.display(),
        metadata.mime_type
    );

    Ok((metadata, contents))
}

/// Write a received file into `dir` under its download name. An existing file is
/// never replaced; the name gains a ` (n)` suffix instead.
pub fn write_received_file(dir: &Path, metadata: &FileMetadata, contents: &[u8]) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let name = metadata.download_name();

    let mut attempt = 0u32;
    loop {
        let candidate = dir.join(numbered_name(&name, attempt));
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(mut file) => {
                file.write_all(contents)?;
                file.flush()?;
                debug!("Wrote {} bytes to {}", contents.len(), candidate.display());
                return Ok(candidate);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => attempt += 1,
            Err(e) => return Err(e.into()),
        }
    }
}

/// `report.pdf` → `report (2).pdf`; attempt 0 keeps the name as is.
fn numbered_name(name: &str, attempt: u32) -> String {
    if attempt == 0 {
        return name.to_string();
    }
    match name.rfind('.') {
        Some(dot) if dot > 0 => format!("{} ({}){}", &name[..dot], attempt, &name[dot..]),
        _ => format!("{} ({})", name, attempt),
    }
}

/// Best effort; headless machines have no clipboard.
pub fn copy_to_clipboard(text: &str) -> bool {
    match Clipboard::new() {
        Ok(mut clipboard) => clipboard.set_text(text.to_string()).is_ok(),
        Err(e) => {
            debug!("Clipboard unavailable: {}", e);
            false
        }
    }
}

/// Print `prompt` and read one trimmed line from stdin.
pub fn prompt_line(prompt: &str) -> Result<String> {
    let stdin = io::stdin();
    read_answer(prompt, &mut stdin.lock(), &mut io::stdout())
}

pub fn prompt_yes_no(prompt: &str) -> Result<bool> {
    let answer = prompt_line(&format!("{} [y/N] ", prompt))?;
    Ok(is_yes(&answer))
}

/// `None` when the user just pressed enter.
pub fn prompt_passphrase(prompt: &str) -> Result<Option<String>> {
    let answer = prompt_line(prompt)?;
    Ok(if answer.is_empty() { None } else { Some(answer) })
}

fn read_answer<R: BufRead, W: Write>(prompt: &str, input: &mut R, output: &mut W) -> Result<String> {
    output.write_all(prompt.as_bytes())?;
    output.flush()?;

    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Err(TransferError::Io(io::Error::new(
            ErrorKind::UnexpectedEof,
            "stdin closed",
        )));
    }
    Ok(line.trim().to_string())
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.to_ascii_lowercase().as_str(), "y" | "yes")
}
