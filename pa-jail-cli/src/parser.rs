//! Command-line argument parser using `clap` derive macros.

use clap::{Args, Parser, Subcommand};

/// Set up, run commands inside, and tear down jails for student code.
#[derive(Parser, Debug)]
#[command(
    name = "pa-jail",
    version,
    about,
    long_about = "pa-jail builds per-user chroot jails for running untrusted \
student code. Jail locations must be enabled by a root-owned pa-jail.conf \
policy file; commands run as an unprivileged user on a fresh pty inside \
new IPC, mount, and pid namespaces."
)]
pub struct Cli {
    /// The requested action.
    #[command(subcommand)]
    pub command: Command,
}

/// Flags shared by every subcommand.
#[derive(Args, Debug)]
pub struct CommonArgs {
    /// Narrate each operation in shell-like syntax
    #[arg(short = 'V', long)]
    pub verbose: bool,

    /// Print what would be done without doing it (implies --verbose)
    #[arg(short = 'n', long)]
    pub dry_run: bool,
}

/// The pa-jail subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a jail directory and optionally populate it
    Init(InitArgs),
    /// Run a command inside a jail as an unprivileged user
    Run(RunArgs),
    /// Atomically rename a jail within its permitted directory
    Mv(MvArgs),
    /// Unmount everything under a jail and remove it
    Rm(RmArgs),
}

/// Arguments for `pa-jail init`.
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Shared flags.
    #[command(flatten)]
    pub common: CommonArgs,

    /// Staging directory for hard-link donors of cross-device files
    #[arg(short = 'S', long, value_name = "DIR")]
    pub skeleton: Option<String>,

    /// File list describing what to place in the jail (`-` for stdin)
    #[arg(short = 'f', long, value_name = "FILE")]
    pub files: Option<String>,

    /// The jail directory
    #[arg(value_name = "JAILDIR")]
    pub jaildir: String,

    /// The user the jail is prepared for
    #[arg(value_name = "USER")]
    pub user: Option<String>,
}

/// Arguments for `pa-jail run`.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Shared flags.
    #[command(flatten)]
    pub common: CommonArgs,

    /// Staging directory for hard-link donors of cross-device files
    #[arg(short = 'S', long, value_name = "DIR")]
    pub skeleton: Option<String>,

    /// File list describing what to place in the jail (`-` for stdin)
    #[arg(short = 'f', long, value_name = "FILE")]
    pub files: Option<String>,

    /// Write the supervisor's pid here (zeroed at exit with --fg)
    #[arg(short = 'p', long, value_name = "FILE")]
    pub pid_file: Option<String>,

    /// Unmount and empty the jail before populating it
    #[arg(short = 'r', long)]
    pub replace: bool,

    /// Stay in the foreground and propagate the command's exit status
    #[arg(long)]
    pub fg: bool,

    /// Kill the command after this many (possibly fractional) seconds
    #[arg(short = 'T', long, value_name = "SEC")]
    pub timeout: Option<f64>,

    /// Feed this file (or FIFO) to the command's terminal
    #[arg(short = 'i', long, value_name = "FILE")]
    pub input: Option<String>,

    /// Suppress the timeout/termination notices
    #[arg(short = 'q')]
    pub quiet: bool,

    /// The jail directory
    #[arg(value_name = "JAILDIR")]
    pub jaildir: String,

    /// The unprivileged user to run as
    #[arg(value_name = "USER")]
    pub user: String,

    /// The command and its arguments
    #[arg(
        value_name = "COMMAND",
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub command: Vec<String>,
}

/// Arguments for `pa-jail mv`.
#[derive(Args, Debug)]
pub struct MvArgs {
    /// Shared flags.
    #[command(flatten)]
    pub common: CommonArgs,

    /// The jail to rename
    #[arg(value_name = "OLDDIR")]
    pub olddir: String,

    /// The new location, inside the same permitted directory
    #[arg(value_name = "NEWDIR")]
    pub newdir: String,
}

/// Arguments for `pa-jail rm`.
#[derive(Args, Debug)]
pub struct RmArgs {
    /// Shared flags.
    #[command(flatten)]
    pub common: CommonArgs,

    /// Succeed even if the jail no longer exists
    #[arg(short = 'f', long)]
    pub force: bool,

    /// The jail directory to remove
    #[arg(value_name = "JAILDIR")]
    pub jaildir: String,
}
