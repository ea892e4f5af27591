// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Script parsing and execution
//!
//! One syscall per line, `<pid> <op> <args>`. Blank lines and lines starting
//! with `#` are skipped. Syscall failures are reported inline and do not stop
//! the script; malformed lines and references to unknown processes do.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use fdtable_core::{
    FdError, FdTableConfig, InMemoryStorage, Pid, Process, RawFd, O_APPEND, O_CREAT, O_EXCL,
    O_NOCTTY, O_RDONLY, O_RDWR, O_TRUNC, O_WRONLY, SEEK_CUR, SEEK_END, SEEK_SET,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Open { path: String, flags: u32 },
    Read { fd: RawFd, len: usize },
    Write { fd: RawFd, data: String },
    Lseek { fd: RawFd, offset: i64, whence: i32 },
    Close { fd: RawFd },
    Dup { fd: RawFd },
    Dup2 { old_fd: RawFd, new_fd: RawFd },
    Fork { child: Pid },
    Exit,
    Mkdir { path: String },
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Open { .. } => "open",
            Op::Read { .. } => "read",
            Op::Write { .. } => "write",
            Op::Lseek { .. } => "lseek",
            Op::Close { .. } => "close",
            Op::Dup { .. } => "dup",
            Op::Dup2 { .. } => "dup2",
            Op::Fork { .. } => "fork",
            Op::Exit => "exit",
            Op::Mkdir { .. } => "mkdir",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Line {
    pub number: usize,
    pub pid: Pid,
    pub op: Op,
}

/// Parse a whole script, failing on the first malformed line
pub fn parse_script(input: &str) -> Result<Vec<Line>> {
    let mut lines = Vec::new();
    for (idx, raw) in input.lines().enumerate() {
        let number = idx + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let (pid, op) = parse_line(trimmed).with_context(|| format!("line {number}: {trimmed}"))?;
        lines.push(Line { number, pid, op });
    }
    Ok(lines)
}

fn parse_line(line: &str) -> Result<(Pid, Op)> {
    let (pid, rest) = split_word(line);
    let pid = Pid(pid.parse().context("invalid pid")?);
    let (op, args) = split_word(rest);
    let mut words = args.split_whitespace();
    let mut next = |what: &str| words.next().ok_or_else(|| anyhow!("missing {what}"));

    let op = match op {
        "open" => Op::Open {
            path: next("path")?.to_string(),
            flags: parse_open_flags(next("flags")?)?,
        },
        "read" => Op::Read {
            fd: parse_fd(next("fd")?)?,
            len: next("length")?.parse().context("invalid length")?,
        },
        "write" => {
            let (fd, data) = split_word(args);
            Op::Write {
                fd: parse_fd(fd)?,
                data: unescape(data),
            }
        }
        "lseek" => Op::Lseek {
            fd: parse_fd(next("fd")?)?,
            offset: next("offset")?.parse().context("invalid offset")?,
            whence: match next("whence")? {
                "set" => SEEK_SET,
                "cur" => SEEK_CUR,
                "end" => SEEK_END,
                other => bail!("invalid whence {other:?}"),
            },
        },
        "close" => Op::Close {
            fd: parse_fd(next("fd")?)?,
        },
        "dup" => Op::Dup {
            fd: parse_fd(next("fd")?)?,
        },
        "dup2" => Op::Dup2 {
            old_fd: parse_fd(next("old fd")?)?,
            new_fd: parse_fd(next("new fd")?)?,
        },
        "fork" => Op::Fork {
            child: Pid(next("child pid")?.parse().context("invalid child pid")?),
        },
        "exit" => Op::Exit,
        "mkdir" => Op::Mkdir {
            path: next("path")?.to_string(),
        },
        "" => bail!("missing operation"),
        other => bail!("unknown operation {other:?}"),
    };
    Ok((pid, op))
}

fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(end) => (&s[..end], s[end..].trim_start()),
        None => (s, ""),
    }
}

fn parse_fd(word: &str) -> Result<RawFd> {
    word.parse().with_context(|| format!("invalid descriptor {word:?}"))
}

/// `rdwr,creat,trunc` style names, or a raw number passed through unchecked
pub fn parse_open_flags(text: &str) -> Result<u32> {
    if let Ok(raw) = text.parse::<u32>() {
        return Ok(raw);
    }
    let mut flags = O_RDONLY;
    for name in text.split([',', '|']).filter(|name| !name.is_empty()) {
        flags |= match name {
            "rdonly" => O_RDONLY,
            "wronly" => O_WRONLY,
            "rdwr" => O_RDWR,
            "creat" => O_CREAT,
            "excl" => O_EXCL,
            "trunc" => O_TRUNC,
            "append" => O_APPEND,
            "noctty" => O_NOCTTY,
            other => bail!("unknown open flag {other:?}"),
        };
    }
    Ok(flags)
}

fn unescape(data: &str) -> String {
    let mut out = String::with_capacity(data.len());
    let mut chars = data.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('s') => out.push(' '),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub executed: usize,
    pub failed: usize,
}

/// A set of processes sharing one in-memory storage layer. Pid 1 exists
/// from the start.
pub struct Session {
    storage: Arc<InMemoryStorage>,
    processes: BTreeMap<Pid, Process>,
    config: FdTableConfig,
}

impl Session {
    pub const INIT_PID: Pid = Pid(1);

    pub fn new(config: FdTableConfig) -> Self {
        let storage = Arc::new(InMemoryStorage::new());
        let mut processes = BTreeMap::new();
        processes.insert(
            Self::INIT_PID,
            Process::new(Self::INIT_PID, storage.clone(), config.clone()),
        );
        Self {
            storage,
            processes,
            config,
        }
    }

    pub fn storage(&self) -> &Arc<InMemoryStorage> {
        &self.storage
    }

    pub fn config(&self) -> &FdTableConfig {
        &self.config
    }

    #[cfg(test)]
    pub fn process(&self, pid: Pid) -> Option<&Process> {
        self.processes.get(&pid)
    }

    /// Execute every line, writing one result line each to `out`
    pub fn run<W: Write>(&mut self, script: &[Line], out: &mut W, fail_fast: bool) -> Result<Summary> {
        let mut summary = Summary::default();
        for line in script {
            let result = self
                .execute(line)
                .with_context(|| format!("line {}", line.number))?;
            summary.executed += 1;
            match result {
                Ok(value) => writeln!(out, "{} {} -> {value}", line.pid, line.op.name())?,
                Err(err) => {
                    summary.failed += 1;
                    writeln!(
                        out,
                        "{} {} -> error: {err} (errno={})",
                        line.pid,
                        line.op.name(),
                        err.errno()
                    )?;
                    if fail_fast {
                        bail!("line {}: {} failed: {err}", line.number, line.op.name());
                    }
                }
            }
        }
        Ok(summary)
    }

    fn live(&self, pid: Pid) -> Result<&Process> {
        self.processes.get(&pid).ok_or_else(|| anyhow!("no process {pid}"))
    }

    /// The outer error is a script error; the inner one is the syscall result
    fn execute(&mut self, line: &Line) -> Result<Result<String, FdError>> {
        tracing::trace!(pid = %line.pid, op = line.op.name(), "executing");
        let result = match &line.op {
            Op::Exit => {
                let process = self
                    .processes
                    .remove(&line.pid)
                    .ok_or_else(|| anyhow!("no process {}", line.pid))?;
                Ok(process.exit().to_string())
            }
            Op::Fork { child } => {
                if self.processes.contains_key(child) {
                    bail!("process {child} already exists");
                }
                let forked = self.live(line.pid)?.fork(*child);
                self.processes.insert(*child, forked);
                Ok(child.to_string())
            }
            Op::Mkdir { path } => {
                self.live(line.pid)?;
                self.storage.mkdir(path).map(|()| "ok".to_string())
            }
            op => syscall(self.live(line.pid)?, op),
        };
        Ok(result)
    }
}

/// Largest buffer a single scripted `read` allocates
pub const MAX_READ: usize = 64 * 1024;

fn syscall(process: &Process, op: &Op) -> Result<String, FdError> {
    match op {
        Op::Open { path, flags } => process.open(path, *flags, 0o644).map(|fd| fd.to_string()),
        Op::Read { fd, len } => {
            // A short read is always legal, so oversized requests are capped
            let mut buf = vec![0u8; (*len).min(MAX_READ)];
            let n = process.read(*fd, &mut buf)?;
            Ok(format!("{:?}", String::from_utf8_lossy(&buf[..n])))
        }
        Op::Write { fd, data } => process.write(*fd, data.as_bytes()).map(|n| n.to_string()),
        Op::Lseek { fd, offset, whence } => {
            process.lseek(*fd, *offset, *whence).map(|pos| pos.to_string())
        }
        Op::Close { fd } => process.close(*fd).map(|()| "ok".to_string()),
        Op::Dup { fd } => process.dup(*fd).map(|fd| fd.to_string()),
        Op::Dup2 { old_fd, new_fd } => process.dup2(*old_fd, *new_fd).map(|fd| fd.to_string()),
        // Session-level operations never reach a single process
        Op::Fork { .. } | Op::Exit | Op::Mkdir { .. } => Err(FdError::InvalidArgument),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(script: &str) -> (Session, String, Summary) {
        let lines = parse_script(script).unwrap();
        let mut session = Session::new(FdTableConfig::default());
        let mut out = Vec::new();
        let summary = session.run(&lines, &mut out, false).unwrap();
        (session, String::from_utf8(out).unwrap(), summary)
    }

    #[test]
    fn parses_every_operation() {
        let lines = parse_script(
            "# setup\n\
             1 mkdir /d\n\
             1 open /d/f rdwr,creat\n\
             \n\
             1 write 0 hello world\n\
             1 lseek 0 -2 end\n\
             1 read 0 16\n\
             1 dup 0\n\
             1 dup2 0 5\n\
             1 fork 2\n\
             2 close 5\n\
             2 exit\n",
        )
        .unwrap();
        let ops: Vec<_> = lines.iter().map(|l| l.op.clone()).collect();
        assert_eq!(lines[0].number, 2);
        assert_eq!(ops[1], Op::Open { path: "/d/f".into(), flags: O_RDWR | O_CREAT });
        assert_eq!(ops[2], Op::Write { fd: 0, data: "hello world".into() });
        assert_eq!(ops[3], Op::Lseek { fd: 0, offset: -2, whence: SEEK_END });
        assert_eq!(ops[6], Op::Dup2 { old_fd: 0, new_fd: 5 });
        assert_eq!(ops[7], Op::Fork { child: Pid(2) });
        assert_eq!(lines[9].pid, Pid(2));
        assert_eq!(ops[9], Op::Exit);
    }

    #[test]
    fn rejects_malformed_lines() {
        let err = parse_script("1 open /f\n").unwrap_err();
        assert!(format!("{err:#}").contains("line 1"));
        assert!(parse_script("x close 0").is_err());
        assert!(parse_script("1 frobnicate 0").is_err());
        assert!(parse_script("1 lseek 0 1 sideways").is_err());
        assert!(parse_script("1 open /f rdwr,bogus").is_err());
        assert!(parse_script("1").is_err());
    }

    #[test]
    fn open_flags_accept_names_and_numbers() {
        assert_eq!(parse_open_flags("rdonly").unwrap(), O_RDONLY);
        assert_eq!(parse_open_flags("wronly|append").unwrap(), O_WRONLY | O_APPEND);
        assert_eq!(parse_open_flags("rdwr,creat,excl,trunc").unwrap(), O_RDWR | O_CREAT | O_EXCL | O_TRUNC);
        assert_eq!(parse_open_flags("1024").unwrap(), 1024);
    }

    #[test]
    fn write_text_is_unescaped() {
        assert_eq!(unescape(r"a\nb\sc\\"), "a\nb c\\");
    }

    #[test]
    fn dup_shares_offset_in_output() {
        let (_session, out, summary) = run(
            "1 open /f rdwr,creat\n\
             1 write 0 abcdef\n\
             1 lseek 0 0 set\n\
             1 dup 0\n\
             1 read 0 2\n\
             1 read 1 2\n",
        );
        assert_eq!(summary, Summary { executed: 6, failed: 0 });
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines[0], "1 open -> 0");
        assert_eq!(lines[1], "1 write -> 6");
        assert_eq!(lines[3], "1 dup -> 1");
        assert_eq!(lines[4], "1 read -> \"ab\"");
        assert_eq!(lines[5], "1 read -> \"cd\"");
    }

    #[test]
    fn oversized_read_length_is_capped() {
        let (_session, out, summary) = run(
            "1 open /f rdwr,creat\n\
             1 write 0 abc\n\
             1 lseek 0 0 set\n\
             1 read 0 18446744073709551615\n\
             1 read 0 18446744073709551615\n",
        );
        assert_eq!(summary, Summary { executed: 5, failed: 0 });
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines[3], "1 read -> \"abc\"");
        assert_eq!(lines[4], "1 read -> \"\"");
    }

    #[test]
    fn write_far_past_eof_reports_no_space() {
        let (_session, out, summary) = run(
            "1 open /f rdwr,creat\n\
             1 lseek 0 9000000000000000000 set\n\
             1 write 0 x\n\
             1 lseek 0 0 cur\n",
        );
        assert_eq!(summary.failed, 1);
        let lines: Vec<_> = out.lines().collect();
        assert!(lines[2].ends_with(&format!("(errno={})", libc::ENOSPC)));
        assert_eq!(lines[3], "1 lseek -> 9000000000000000000");
    }

    #[test]
    fn syscall_errors_are_reported_and_do_not_stop() {
        let (_session, out, summary) = run(
            "1 close 3\n\
             1 open /missing rdonly\n\
             1 open /f wronly,creat\n",
        );
        assert_eq!(summary, Summary { executed: 3, failed: 2 });
        let lines: Vec<_> = out.lines().collect();
        assert!(lines[0].starts_with("1 close -> error: "));
        assert!(lines[0].ends_with(&format!("(errno={})", libc::EBADF)));
        assert!(lines[1].ends_with(&format!("(errno={})", libc::ENOENT)));
        assert_eq!(lines[2], "1 open -> 0");
    }

    #[test]
    fn fail_fast_stops_at_first_error() {
        let lines = parse_script("1 close 0\n1 open /f wronly,creat\n").unwrap();
        let mut session = Session::new(FdTableConfig::default());
        let mut out = Vec::new();
        assert!(session.run(&lines, &mut out, true).is_err());
        assert_eq!(String::from_utf8(out).unwrap().lines().count(), 1);
        assert_eq!(session.process(Session::INIT_PID).unwrap().table().open_count(), 0);
    }

    #[test]
    fn fork_and_exit_track_processes() {
        let (session, out, _) = run(
            "1 open /f rdwr,creat\n\
             1 fork 2\n\
             2 write 0 xy\n\
             1 write 0 z\n\
             2 exit\n",
        );
        assert!(out.contains("1 fork -> 2"));
        assert!(out.contains("2 exit -> 1"));
        assert!(session.process(Pid(2)).is_none());
        assert_eq!(session.storage().contents("/f").unwrap(), b"xyz");
        assert_eq!(session.storage().open_handle_count(), 1);
    }

    #[test]
    fn unknown_process_is_a_script_error() {
        let lines = parse_script("7 close 0\n").unwrap();
        let mut session = Session::new(FdTableConfig::default());
        let mut out = Vec::new();
        let err = session.run(&lines, &mut out, false).unwrap_err();
        assert!(format!("{err:#}").contains("no process 7"));

        let lines = parse_script("1 fork 1\n").unwrap();
        assert!(session.run(&lines, &mut out, false).is_err());
    }

    #[test]
    fn table_limit_comes_from_config() {
        let lines = parse_script("1 open /a rdwr,creat\n1 dup 0\n1 dup 0\n").unwrap();
        let mut session = Session::new(FdTableConfig::default().with_max_open_files(2));
        let mut out = Vec::new();
        let summary = session.run(&lines, &mut out, false).unwrap();
        assert_eq!(summary.failed, 1);
        let text = String::from_utf8(out).unwrap();
        assert!(text.lines().last().unwrap().ends_with(&format!("(errno={})", libc::EMFILE)));
        assert_eq!(session.config().limits.max_open_files, 2);
    }
}
