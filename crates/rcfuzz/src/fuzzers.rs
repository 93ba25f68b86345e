use derive_more::Display;
use serde::{Deserialize, Serialize};

/// The baseline fuzzers the supervisor knows how to drive.
///
/// The set mirrors the driver's support matrix; adding a kind here requires a
/// matching entry in the external driver binary.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    Serialize,
    Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
#[value(rename_all = "lower")]
pub enum FuzzerKind {
    #[display("afl")]
    Afl,
    #[display("aflfast")]
    AflFast,
    #[display("fairfuzz")]
    FairFuzz,
    #[display("mopt")]
    Mopt,
    #[display("lafintel")]
    LafIntel,
    #[display("learnafl")]
    LearnAfl,
    #[display("redqueen")]
    Redqueen,
    #[display("radamsa")]
    Radamsa,
    #[display("qsym")]
    Qsym,
    #[display("angora")]
    Angora,
    #[display("libfuzzer")]
    LibFuzzer,
}

impl FuzzerKind {
    pub const ALL: [FuzzerKind; 11] = [
        FuzzerKind::Afl,
        FuzzerKind::AflFast,
        FuzzerKind::FairFuzz,
        FuzzerKind::Mopt,
        FuzzerKind::LafIntel,
        FuzzerKind::LearnAfl,
        FuzzerKind::Redqueen,
        FuzzerKind::Radamsa,
        FuzzerKind::Qsym,
        FuzzerKind::Angora,
        FuzzerKind::LibFuzzer,
    ];

    pub fn profile(self) -> &'static FuzzerProfile {
        match self {
            FuzzerKind::Angora => &ANGORA_PROFILE,
            FuzzerKind::LibFuzzer => &LIBFUZZER_PROFILE,
            _ => &AFL_PROFILE,
        }
    }
}

/// Static per-fuzzer facts the supervisor needs; how to actually launch a
/// fuzzer is the driver's business.
#[derive(Debug)]
pub struct FuzzerProfile {
    /// Directory under the fuzzer's output holding its seed queue.
    pub queue_dir: &'static str,
    /// Directory under the fuzzer's output holding crashing inputs.
    pub crash_dir: &'static str,
    /// Files in the crash dir that are not crashes.
    pub skip_crash_files: &'static [&'static str],
    pub afl_based: bool,
    /// Angora refuses to start when its output directory already exists.
    pub create_output_dir: bool,
}

static AFL_PROFILE: FuzzerProfile = FuzzerProfile {
    queue_dir: "queue",
    crash_dir: "crashes",
    skip_crash_files: &["README.txt"],
    afl_based: true,
    create_output_dir: true,
};

static ANGORA_PROFILE: FuzzerProfile = FuzzerProfile {
    queue_dir: "queue",
    crash_dir: "crashes",
    skip_crash_files: &[],
    afl_based: false,
    create_output_dir: false,
};

static LIBFUZZER_PROFILE: FuzzerProfile = FuzzerProfile {
    queue_dir: "queue",
    crash_dir: "crashes",
    skip_crash_files: &["README.txt"],
    afl_based: false,
    create_output_dir: true,
};
