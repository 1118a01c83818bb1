//! Match settings and the character/stage tables they reference.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Number of selectable stages. Hardcoded to mirror client content; the
/// server cannot read the actual stage roster.
pub const STAGE_COUNT: i32 = 5;

/// Character classification used to restrict selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CharacterTier {
    Normal,
    Odd,
    Hyperspeed,
}

/// Per-character tier table, indexed by character id. Hardcoded to mirror
/// the client's character roster and must stay in sync with it.
pub const CHARACTER_TIERS: [CharacterTier; 16] = [
    CharacterTier::Normal,
    CharacterTier::Normal,
    CharacterTier::Normal,
    CharacterTier::Normal,
    CharacterTier::Normal,
    CharacterTier::Normal,
    CharacterTier::Normal,
    CharacterTier::Odd,
    CharacterTier::Odd,
    CharacterTier::Odd,
    CharacterTier::Normal,
    CharacterTier::Normal,
    CharacterTier::Normal,
    CharacterTier::Hyperspeed,
    CharacterTier::Odd,
    CharacterTier::Odd,
];

/// Which character tiers players may currently use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllowedTiers {
    All,
    NormalOnly,
    OddOnly,
    HyperspeedOnly,
    NoHyperspeed,
}

impl AllowedTiers {
    pub const VARIANTS: &'static [&'static str] =
        &["All", "NormalOnly", "OddOnly", "HyperspeedOnly", "NoHyperspeed"];

    /// True when the given character id is selectable under this restriction.
    pub fn permits(self, character_id: usize) -> bool {
        let Some(&tier) = CHARACTER_TIERS.get(character_id) else {
            return false;
        };
        match self {
            AllowedTiers::All => true,
            AllowedTiers::NormalOnly => tier == CharacterTier::Normal,
            AllowedTiers::OddOnly => tier == CharacterTier::Odd,
            AllowedTiers::HyperspeedOnly => tier == CharacterTier::Hyperspeed,
            AllowedTiers::NoHyperspeed => tier != CharacterTier::Hyperspeed,
        }
    }

    /// First character id (scanning the fixed tier table) selectable under
    /// this restriction.
    pub fn first_allowed_character(self) -> Option<usize> {
        (0..CHARACTER_TIERS.len()).find(|&id| self.permits(id))
    }

    /// Chat line describing the restriction to players.
    pub fn describe(self) -> &'static str {
        match self {
            AllowedTiers::All => "All characters are allowed.",
            AllowedTiers::NormalOnly => "Only characters from the Normal tier are allowed.",
            AllowedTiers::OddOnly => "Only characters from the Odd tier are allowed.",
            AllowedTiers::HyperspeedOnly => "Only characters from the Hyperspeed tier are allowed.",
            AllowedTiers::NoHyperspeed => "Any character NOT from the Hyperspeed tier is allowed.",
        }
    }

    /// Next restriction in the lobby tier cycle:
    /// NormalOnly -> OddOnly -> HyperspeedOnly -> NormalOnly.
    pub fn cycled(self) -> AllowedTiers {
        match self {
            AllowedTiers::NormalOnly => AllowedTiers::OddOnly,
            AllowedTiers::OddOnly => AllowedTiers::HyperspeedOnly,
            _ => AllowedTiers::NormalOnly,
        }
    }
}

impl FromStr for AllowedTiers {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "All" => Ok(AllowedTiers::All),
            "NormalOnly" => Ok(AllowedTiers::NormalOnly),
            "OddOnly" => Ok(AllowedTiers::OddOnly),
            "HyperspeedOnly" => Ok(AllowedTiers::HyperspeedOnly),
            "NoHyperspeed" => Ok(AllowedTiers::NoHyperspeed),
            _ => Err(()),
        }
    }
}

impl fmt::Display for AllowedTiers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// How the stage changes on each return to lobby.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageRotationMode {
    None,
    Sequenced,
    Random,
}

impl StageRotationMode {
    pub const VARIANTS: &'static [&'static str] = &["None", "Sequenced", "Random"];
}

impl FromStr for StageRotationMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "None" => Ok(StageRotationMode::None),
            "Sequenced" => Ok(StageRotationMode::Sequenced),
            "Random" => Ok(StageRotationMode::Random),
            _ => Err(()),
        }
    }
}

impl fmt::Display for StageRotationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// How the allowed tiers change on each return to lobby.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TierRotationMode {
    None,
    Cycle,
    Random,
    WeightedRandom,
}

impl TierRotationMode {
    pub const VARIANTS: &'static [&'static str] = &["None", "Cycle", "Random", "WeightedRandom"];

    /// Pick the next restriction. `WeightedRandom` draws Normal:Odd:Hyperspeed
    /// with weights 10:3:1 out of 14.
    pub fn next_tiers<R: Rng>(self, current: AllowedTiers, rng: &mut R) -> AllowedTiers {
        const SINGLE_TIERS: [AllowedTiers; 3] = [
            AllowedTiers::NormalOnly,
            AllowedTiers::OddOnly,
            AllowedTiers::HyperspeedOnly,
        ];
        const WEIGHTED: [usize; 14] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 2];

        match self {
            TierRotationMode::None => current,
            TierRotationMode::Cycle => current.cycled(),
            TierRotationMode::Random => SINGLE_TIERS[rng.gen_range(0..3)],
            TierRotationMode::WeightedRandom => SINGLE_TIERS[WEIGHTED[rng.gen_range(0..WEIGHTED.len())]],
        }
    }
}

impl FromStr for TierRotationMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "None" => Ok(TierRotationMode::None),
            "Cycle" => Ok(TierRotationMode::Cycle),
            "Random" => Ok(TierRotationMode::Random),
            "WeightedRandom" => Ok(TierRotationMode::WeightedRandom),
            _ => Err(()),
        }
    }
}

impl fmt::Display for TierRotationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Skill level used for AI racers spawned by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AiSkillLevel {
    Easy,
    Average,
    Hard,
}

/// Global match configuration, mutated only by admin commands and lobby
/// rotation. Persisted as JSON after every change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchSettings {
    pub stage_id: i32,
    pub laps: i32,
    pub ai_count: i32,
    pub ai_skill: AiSkillLevel,
    /// Seconds with enough players in the lobby before a race auto starts.
    /// Zero disables auto starting.
    pub auto_start_time: i32,
    pub auto_start_min_players: i32,
    /// Seconds after all players finish before the match returns to lobby.
    /// Zero disables auto returning.
    pub auto_return_time: i32,
    /// Fraction of clients that must vote to return to lobby mid-race.
    pub vote_ratio: f32,
    pub allowed_tiers: AllowedTiers,
    pub stage_rotation_mode: StageRotationMode,
    pub tier_rotation_mode: TierRotationMode,
    /// Seconds a racing player can go without passing a checkpoint before
    /// being disqualified. Zero disables disqualifying.
    pub disqualification_time: i32,
}

impl Default for MatchSettings {
    fn default() -> Self {
        Self {
            stage_id: 0,
            laps: 2,
            ai_count: 0,
            ai_skill: AiSkillLevel::Average,
            auto_start_time: 60,
            auto_start_min_players: 2,
            auto_return_time: 15,
            vote_ratio: 1.0,
            allowed_tiers: AllowedTiers::All,
            stage_rotation_mode: StageRotationMode::None,
            tier_rotation_mode: TierRotationMode::None,
            disqualification_time: 120,
        }
    }
}
