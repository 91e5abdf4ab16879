/**************************************************************************/
/*  This file is part of PGM2SSAT.                                        */
/*                                                                        */
/*  Copyright (C) 2025                                                    */
/*    CEA (Commissariat à l'énergie atomique et aux énergies              */
/*         alternatives)                                                  */
/*                                                                        */
/*  you can redistribute it and/or modify it under the terms of the GNU   */
/*  Lesser General Public License as published by the Free Software       */
/*  Foundation, version 2.1.                                              */
/*                                                                        */
/*  It is distributed in the hope that it will be useful,                 */
/*  but WITHOUT ANY WARRANTY; without even the implied warranty of        */
/*  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the         */
/*  GNU Lesser General Public License for more details.                   */
/*                                                                        */
/*  See the GNU Lesser General Public License version 2.1                 */
/*  for more details (enclosed in the file licenses/LGPLv2.1).            */
/*                                                                        */
/**************************************************************************/

//! Temporary files and external processes.

use anyhow::Context;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use tracing::trace;

/// Number of bytes of output kept by [`LastLines`]
const TAIL: usize = 1024;

#[derive(Default)]
struct Tail {
    bytes: VecDeque<u8>,
    error: Option<std::io::ErrorKind>,
    closed: bool,
}

/// Consumes the reading end of a pipe in a thread, so that the writer never blocks, and keeps
/// the last kilobyte read and the first error.
pub struct LastLines {
    tail: Arc<Mutex<Tail>>,
}

impl LastLines {
    /// Spawns the thread consuming `read`.
    pub fn new<R: Read + Send + 'static>(mut read: R) -> Self {
        let tail = Arc::new(Mutex::new(Tail::default()));
        let shared = tail.clone();
        std::thread::spawn(move || {
            let mut buffer = [0; TAIL];
            loop {
                let res = read.read(&mut buffer);
                let mut tail = match shared.lock() {
                    Ok(t) => t,
                    Err(_) => break,
                };
                match res {
                    Ok(0) => tail.closed = true,
                    Ok(n) => {
                        tail.bytes.extend(&buffer[..n]);
                        let excess = tail.bytes.len().saturating_sub(TAIL);
                        tail.bytes.drain(..excess);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(e) => tail.error = Some(e.kind()),
                }
                if tail.closed || tail.error.is_some() {
                    break;
                }
            }
        });
        LastLines { tail }
    }

    /// Waits at most `timeout` for the writing end to be closed.
    pub fn settle(&self, timeout: std::time::Duration) {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            match self.tail.lock() {
                Ok(tail) if !tail.closed && tail.error.is_none() => {}
                _ => return,
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
    }

    /// The last bytes read so far, and the error that stopped reading, if any.
    pub fn get(&self) -> (Vec<u8>, std::io::Result<()>) {
        let tail = self.tail.lock().expect("poisoned lock");
        let bytes = tail.bytes.iter().copied().collect();
        let err = match tail.error {
            None => Ok(()),
            Some(kind) => Err(std::io::Error::from(kind)),
        };
        (bytes, err)
    }
}

impl Drop for LastLines {
    fn drop(&mut self) {
        if let Ok(mut tail) = self.tail.lock() {
            tail.closed = true;
        }
    }
}

#[test]
fn last_lines() {
    use std::os::unix::io::FromRawFd;
    let (raw_read, raw_write) = nix::unistd::pipe().expect("creating a pipe");
    let (read, mut write) = unsafe { (File::from_raw_fd(raw_read), File::from_raw_fd(raw_write)) };
    let lines = LastLines::new(read);
    for i in 0..=100_000 {
        writeln!(&mut write, "{}", i).unwrap();
    }
    drop(write);
    std::thread::sleep(std::time::Duration::from_secs(1));
    let (txt, err) = lines.get();
    assert!(err.is_ok());
    assert!(txt.len() <= TAIL);
    let expected = b"99999\n100000\n";
    assert_eq!(&txt[(txt.len() - expected.len())..], expected);
}

/// Returns whether a message with this level would be printed
pub fn would_log(level: tracing::Level) -> bool {
    level <= tracing::level_filters::LevelFilter::current()
}

/// A temporary file that is removed on drop only if debugging is not enabled.
pub enum MaybePersistentTempFile {
    /// The file will be removed
    Temp(tempfile::NamedTempFile),
    /// The file is kept: file descriptor and path
    Persistent(File, std::path::PathBuf),
}

impl MaybePersistentTempFile {
    /// Creates a temporary file with this extension (including the leading dot). Names are
    /// unique, so that concurrent runs do not collide.
    pub fn new(extension: &str) -> anyhow::Result<Self> {
        let temp = tempfile::Builder::new()
            .prefix("pgm2ssat")
            .suffix(extension)
            .tempfile()?;
        if would_log(tracing::Level::DEBUG) {
            let (file, path) = temp.keep()?;
            trace!("Persisting temporary data to {}", path.display());
            Ok(Self::Persistent(file, path))
        } else {
            Ok(Self::Temp(temp))
        }
    }

    /// Returns the underlying File.
    pub fn as_file_mut(&mut self) -> &mut File {
        match self {
            MaybePersistentTempFile::Temp(file) => file.as_file_mut(),
            MaybePersistentTempFile::Persistent(file, _) => file,
        }
    }
}

impl Write for MaybePersistentTempFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.as_file_mut().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.as_file_mut().flush()
    }
}

impl AsRef<Path> for MaybePersistentTempFile {
    fn as_ref(&self) -> &Path {
        match self {
            MaybePersistentTempFile::Persistent(_, path) => path.as_ref(),
            MaybePersistentTempFile::Temp(file) => file.as_ref(),
        }
    }
}

/// Runs an external tool to completion and returns its standard output.
///
/// The tool is killed if we die. A non zero exit status is an error carrying the end of
/// the standard error of the tool.
pub fn run_tool(cmd: &mut Command, what: &str) -> anyhow::Result<Vec<u8>> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    unsafe {
        cmd.pre_exec(|| prctl::set_death_signal(9).map_err(std::io::Error::from_raw_os_error))
    };
    let span = tracing::trace_span!("external tool", timing = true).entered();
    trace!("{} command: {:?}", what, &cmd);
    let mut process = cmd.spawn().with_context(|| format!("running {}", what))?;
    let stderr = LastLines::new(process.stderr.take().context("no stderr pipe")?);
    let mut output = Vec::new();
    process
        .stdout
        .take()
        .context("no stdout pipe")?
        .read_to_end(&mut output)
        .with_context(|| format!("reading output of {}", what))?;
    let status = process
        .wait()
        .with_context(|| format!("waiting for {}", what))?;
    drop(span);
    if !status.success() {
        stderr.settle(std::time::Duration::from_secs(1));
    }
    let (err, _) = stderr.get();
    anyhow::ensure!(
        status.success(),
        "{} failed with code {:?} signal {:?}: {}",
        what,
        status.code(),
        status.signal(),
        String::from_utf8_lossy(&err)
    );
    Ok(output)
}

#[test]
fn run_true_and_false() {
    let out = run_tool(Command::new("echo").arg("hello"), "echo").unwrap();
    assert_eq!(out, b"hello\n");
    let err = run_tool(
        Command::new("sh").arg("-c").arg("echo oops >&2; exit 3"),
        "sh",
    )
    .unwrap_err();
    let msg = format!("{}", err);
    assert!(msg.contains("code Some(3)"), "{}", msg);
    assert!(msg.contains("oops"), "{}", msg);
}

#[test]
fn missing_tool() {
    assert!(run_tool(&mut Command::new("/nonexistent/pgm2ssat-tool"), "missing").is_err());
}
