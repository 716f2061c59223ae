//! Command line interface.
//!
//! Flags parse into an [`Invocation`], the immutable per-run configuration
//! everything downstream reads. Stdio paths are normalized to absolute
//! before the mount namespace changes what relative paths mean.

use std::path::{Path, PathBuf};

use clap::Parser;
use nix::sys::resource::Resource;

use omegabox_jail::MountSpec;

use crate::limits::{self, ResourceLimit};
use crate::stdio::StdioRedirects;

#[derive(Parser, Debug)]
#[command(name = "omegabox")]
#[command(about = "Runs untrusted programs under namespaces, seccomp, and resource limits")]
pub struct Cli {
    /// Target program path; defaults to the first argument after `--`
    #[arg(long)]
    pub bin: Option<PathBuf>,

    /// Reported name of the target process
    #[arg(long)]
    pub comm: Option<String>,

    /// Change to this directory inside the container
    #[arg(short = 'd', long)]
    pub chdir: Option<PathBuf>,

    /// Bind a host path into the container: src,dest[,1] (1 = writable)
    #[arg(short = 'b', long = "bind")]
    pub binds: Vec<String>,

    /// Redirect stdin from this path
    #[arg(short = '0', long)]
    pub stdin: Option<PathBuf>,

    /// Redirect stdout to this path
    #[arg(short = '1', long)]
    pub stdout: Option<PathBuf>,

    /// Redirect stderr to this path
    #[arg(short = '2', long)]
    pub stderr: Option<PathBuf>,

    /// Write the verdict record to this path
    #[arg(short = 'M', long)]
    pub meta: Option<PathBuf>,

    /// CPU time limit in milliseconds; also derives the wall deadline
    #[arg(short = 't', long)]
    pub time_limit: Option<u64>,

    /// Slack added to --time-limit for the wall deadline, milliseconds
    #[arg(short = 'w', long, default_value_t = 1000)]
    pub extra_wall_time_limit: u64,

    /// Explicit wall-clock deadline in milliseconds
    #[arg(long)]
    pub wall_time_limit: Option<u64>,

    /// Cgroup-enforced memory ceiling in bytes
    #[arg(short = 'm', long)]
    pub memory_limit: Option<i64>,

    /// Bytes of runtime VM overhead subtracted from reported memory
    #[arg(long, default_value_t = 0)]
    pub vm_memory_size: u64,

    /// Kernel resource limit, NAME=value; repeatable
    #[arg(long = "rlimit")]
    pub rlimits: Vec<String>,

    /// Names the per-script cgroup the invocation is accounted under
    #[arg(long)]
    pub script_basename: Option<String>,

    /// Pre-compiled seccomp-BPF program to install
    #[arg(long)]
    pub seccomp_bpf: Option<PathBuf>,

    /// Skip namespaces and keep stdio; still supervises and writes meta
    #[arg(long)]
    pub disable_sandboxing: bool,

    /// Target argument vector, after --
    #[arg(last = true)]
    pub program_args: Vec<String>,
}

/// Immutable per-run configuration.
#[derive(Debug)]
pub struct Invocation {
    pub program: PathBuf,
    pub program_args: Vec<String>,
    pub comm: Option<String>,
    pub chdir: Option<PathBuf>,
    pub binds: Vec<MountSpec>,
    pub redirects: StdioRedirects,
    pub meta: Option<PathBuf>,
    /// Wall-clock deadline in milliseconds.
    pub wall_time_limit: Option<u64>,
    pub rlimits: Vec<ResourceLimit>,
    pub memory_limit: Option<i64>,
    pub vm_memory_size: u64,
    pub script_basename: Option<String>,
    pub seccomp_bpf: Option<PathBuf>,
    pub disable_sandboxing: bool,
}

impl Cli {
    pub fn into_invocation(self, cwd: &Path) -> Result<Invocation, String> {
        let mut program_args = self.program_args;
        let program = match self.bin {
            Some(bin) => {
                if program_args.is_empty() {
                    program_args.push(bin.to_string_lossy().into_owned());
                }
                bin
            }
            None => match program_args.first() {
                Some(first) => PathBuf::from(first),
                None => return Err("no target program; pass --bin or arguments after --".into()),
            },
        };

        let mut binds = Vec::with_capacity(self.binds.len());
        for spec in &self.binds {
            binds.push(parse_bind(spec)?);
        }

        let mut rlimits = Vec::with_capacity(self.rlimits.len());
        for spec in &self.rlimits {
            rlimits.push(limits::parse(spec)?);
        }

        let mut wall_time_limit = self.wall_time_limit;
        if let Some(time_limit) = self.time_limit {
            // The CPU ceiling rounds up to whole seconds with one second of
            // hard-limit headroom so SIGXCPU lands before SIGKILL.
            let seconds = time_limit.div_ceil(1000);
            rlimits.push(ResourceLimit {
                resource: Resource::RLIMIT_CPU,
                soft: seconds,
                hard: seconds + 1,
            });
            if wall_time_limit.is_none() {
                wall_time_limit = Some(time_limit + self.extra_wall_time_limit);
            }
        }

        let redirects = StdioRedirects {
            stdin: self.stdin.map(|p| absolute(cwd, p)),
            stdout: self.stdout.map(|p| absolute(cwd, p)),
            stderr: self.stderr.map(|p| absolute(cwd, p)),
        };

        Ok(Invocation {
            program,
            program_args,
            comm: self.comm,
            chdir: self.chdir,
            binds,
            redirects,
            meta: self.meta,
            wall_time_limit,
            rlimits,
            memory_limit: self.memory_limit,
            vm_memory_size: self.vm_memory_size,
            script_basename: self.script_basename,
            seccomp_bpf: self.seccomp_bpf,
            disable_sandboxing: self.disable_sandboxing,
        })
    }
}

fn parse_bind(spec: &str) -> Result<MountSpec, String> {
    let parts: Vec<&str> = spec.split(',').collect();
    if !(2..=3).contains(&parts.len()) {
        return Err(format!("invalid bind description: {spec}"));
    }
    let writable = parts.len() == 3 && parts[2] == "1";
    Ok(MountSpec::bind(parts[0], parts[1], writable))
}

fn absolute(cwd: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        cwd.join(path)
    }
}
