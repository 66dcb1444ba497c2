use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};

use crate::backend::InterviewKind;

#[derive(Parser, Debug, Clone)]
#[command(name = "hirecall", about = "Interview call sessions and pipeline tracking")]
pub struct CliArgs {
    /// Settings file (JSON). Created by `config --write`.
    #[arg(long, default_value = "hirecall.json")]
    pub config: PathBuf,

    /// Enable debug mode with verbose logging
    #[arg(long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Follow a candidate's interview pipeline until every stage is settled
    Track {
        application_id: String,
        /// Fetch once and exit
        #[arg(long)]
        once: bool,
    },
    /// Re-send end-call reports that were never acknowledged
    Recover {
        /// Attempts per submission before it is abandoned
        #[arg(long, default_value_t = 8)]
        max_attempts: u32,
    },
    /// Schedule an interview for an application
    Schedule {
        application_id: String,
        /// Start time, RFC 3339 (e.g. 2026-10-20T14:00:00Z)
        #[arg(long)]
        at: DateTime<Utc>,
        #[arg(long, default_value_t = 45)]
        minutes: u32,
        #[arg(long, value_enum, default_value_t = KindArg::Video)]
        kind: KindArg,
    },
    /// Print the effective settings
    Config {
        /// Also write the file-backed settings (env overrides are left out)
        #[arg(long)]
        write: bool,
    },
    /// Record from the default microphone into a raw PCM file
    #[cfg(feature = "native-capture")]
    MicCheck {
        #[arg(long, default_value_t = 5)]
        seconds: u64,
        #[arg(long, default_value = "mic-check.pcm")]
        out: PathBuf,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindArg {
    Video,
    Telephonic,
}

impl From<KindArg> for InterviewKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Video => InterviewKind::Video,
            KindArg::Telephonic => InterviewKind::Telephonic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_track_with_global_flags() {
        let args = CliArgs::parse_from(["hirecall", "--debug", "track", "a1", "--once"]);
        assert!(args.debug);
        assert_eq!(args.config, PathBuf::from("hirecall.json"));
        assert!(matches!(
            args.command,
            Command::Track { ref application_id, once: true } if application_id == "a1"
        ));
    }

    #[test]
    fn parses_schedule_time() {
        let args = CliArgs::parse_from([
            "hirecall",
            "schedule",
            "a1",
            "--at",
            "2026-10-20T14:00:00Z",
            "--kind",
            "telephonic",
        ]);
        let Command::Schedule {
            at, minutes, kind, ..
        } = args.command
        else {
            panic!("expected schedule");
        };
        assert_eq!(at.to_rfc3339(), "2026-10-20T14:00:00+00:00");
        assert_eq!(minutes, 45);
        assert_eq!(InterviewKind::from(kind), InterviewKind::Telephonic);
    }
}
