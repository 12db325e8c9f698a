use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};

use anyhow::{bail, Context, Result};

const HELPER_SCRIPT: &str = include_str!("python_helper.py");

/// Returns true if the file looks like a Python program. There is no
/// real signature, so look for an interpreter hint near the top.
pub fn is_python(data: &[u8]) -> bool {
    if data.len() <= 10 || data[0] != b'#' {
        return false;
    }
    let head = &data[..data.len().min(100)];
    head.windows(6).any(|w| w == b"python")
}

/// Result of one helper round trip.
#[derive(Debug, Clone)]
pub struct PythonAnalysis {
    pub error_message: String,
    pub error_line: u32,
    pub imports: Vec<String>,
    pub attributes: Vec<String>,
    /// Interpreter major version whose result this is.
    pub version: u32,
}

impl PythonAnalysis {
    pub fn good(&self) -> bool {
        self.error_line == 0
    }
}

struct Interpreter {
    child: Child,
    version: u32,
}

impl Interpreter {
    fn start(path: &str, version: u32) -> Result<Self> {
        let child = Command::new(path)
            .arg("-c")
            .arg(HELPER_SCRIPT)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .with_context(|| format!("could not start {}", path))?;
        Ok(Self { child, version })
    }

    fn running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn read_number(stdout: &mut impl Read) -> Result<u32> {
        let mut buf = [0u8; 4];
        stdout
            .read_exact(&mut buf)
            .context("short read from Python helper")?;
        Ok(u32::from_be_bytes(buf))
    }

    fn read_string(stdout: &mut impl Read) -> Result<String> {
        let len = Self::read_number(stdout)? as usize;
        if len > 64 * 1024 * 1024 {
            bail!("implausible string length from Python helper");
        }
        let mut buf = vec![0u8; len];
        stdout
            .read_exact(&mut buf)
            .context("short read from Python helper")?;
        String::from_utf8(buf).context("Python helper sent malformed UTF-8")
    }

    fn read_array(stdout: &mut impl Read) -> Result<Vec<String>> {
        let count = Self::read_number(stdout)?;
        let mut result = Vec::with_capacity(count.min(4096) as usize);
        for _ in 0..count {
            result.push(Self::read_string(stdout)?);
        }
        Ok(result)
    }

    fn parse(&mut self, source: &[u8]) -> Result<PythonAnalysis> {
        let stdin = self.child.stdin.as_mut().context("helper stdin closed")?;
        stdin.write_all(&(source.len() as u32).to_be_bytes())?;
        stdin.write_all(source)?;
        stdin.flush()?;

        let stdout = self.child.stdout.as_mut().context("helper stdout closed")?;
        let error_message = Self::read_string(stdout)?;
        let error_line = Self::read_number(stdout)?;
        let imports = Self::read_array(stdout)?;
        let attributes = Self::read_array(stdout)?;
        let r = PythonAnalysis {
            error_message,
            error_line,
            imports,
            attributes,
            version: self.version,
        };
        Ok(r)
    }
}

impl Drop for Interpreter {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Python import scanner. Keeps one helper process per interpreter
/// version alive across files; tries Python 2 first and falls back to
/// Python 3 when the parse fails.
#[derive(Default)]
pub struct PythonAnalyzer {
    python2: Option<Interpreter>,
    python3: Option<Interpreter>,
}

fn nul_error(source: &[u8], nul: usize) -> PythonAnalysis {
    let line = 1 + source[..nul].iter().filter(|&&b| b == b'\n').count() as u32;
    PythonAnalysis {
        error_message: "source code contains NUL character".to_owned(),
        error_line: line,
        imports: Vec::new(),
        attributes: Vec::new(),
        version: 2,
    }
}

impl PythonAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    fn run(
        slot: &mut Option<Interpreter>,
        path: &str,
        version: u32,
        source: &[u8],
    ) -> Result<PythonAnalysis> {
        if !slot.as_mut().map(Interpreter::running).unwrap_or(false) {
            *slot = Some(Interpreter::start(path, version)?);
        }
        slot.as_mut().unwrap().parse(source)
    }

    /// Parses the source, returning the analysis of the interpreter that
    /// accepted it, or the one whose parse error comes later. Helper
    /// startup and protocol failures surface as errors.
    pub fn parse(&mut self, source: &[u8]) -> Result<PythonAnalysis> {
        if let Some(nul) = source.iter().position(|&b| b == 0) {
            return Ok(nul_error(source, nul));
        }
        let result2 = Self::run(&mut self.python2, "/usr/bin/python", 2, source);
        if let Ok(analysis) = &result2 {
            if analysis.good() {
                return result2;
            }
        }
        let result3 = Self::run(&mut self.python3, "/usr/bin/python3", 3, source);
        match (result2, result3) {
            (_, Ok(a3)) if a3.good() => Ok(a3),
            (Ok(a2), Ok(a3)) => {
                // Pick the version whose parse error comes later.
                if a3.error_line > a2.error_line {
                    Ok(a3)
                } else {
                    Ok(a2)
                }
            }
            (Err(_), Ok(a3)) => Ok(a3),
            (Ok(a2), Err(_)) => Ok(a2),
            (Err(e2), Err(_)) => Err(e2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_python() {
        assert!(is_python(b"#!/usr/bin/python\nimport os\n"));
        assert!(is_python(b"#!/usr/bin/env python3\nprint(1)\n"));
        assert!(!is_python(b"#!/bin/sh\necho hi\n"));
        assert!(!is_python(b"import os\n"));
    }

    #[test]
    fn test_nul_line_numbering() {
        let analysis = nul_error(b"import os\nimport sys\n\0rest", 21);
        assert_eq!(analysis.error_line, 3);
        assert_eq!(analysis.error_message, "source code contains NUL character");
    }

    // Exercises the real helper when an interpreter is installed;
    // otherwise the spawn error path is all we can check.
    #[test]
    fn test_helper_round_trip() {
        let mut analyzer = PythonAnalyzer::new();
        match analyzer.parse(b"import os\nfrom sys import path\n") {
            Ok(analysis) => {
                assert!(analysis.good());
                assert!(analysis.imports.contains(&"os".to_owned()));
                assert!(analysis.imports.contains(&"sys.path".to_owned()));
            }
            Err(_) => {
                // No Python interpreter available in this environment.
            }
        }
    }
}
