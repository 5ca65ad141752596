use crate::hash::Oid;

// the four fixed word lists behind seal names
//
// these are part of the on-disk contract: a repository written here can
// only be name-resolved by implementations carrying identical lists

#[rustfmt::skip]
const ADJECTIVES: [&str; 32] = [
    "amber", "ancient", "bold", "brave", "bright", "calm", "clever", "crimson",
    "daring", "eager", "fierce", "gentle", "golden", "hidden", "humble", "keen",
    "lively", "lucid", "mellow", "noble", "proud", "quiet", "rapid", "silent",
    "silver", "solid", "stable", "steady", "swift", "vivid", "wild", "wise",
];

#[rustfmt::skip]
const NOUNS: [&str; 32] = [
    "anchor", "arrow", "beacon", "bridge", "canyon", "cedar", "comet", "crater",
    "delta", "ember", "falcon", "fjord", "garnet", "glacier", "harbor", "island",
    "lantern", "meadow", "mountain", "otter", "prairie", "raven", "reef", "river",
    "sparrow", "summit", "thicket", "tide", "tundra", "valley", "willow", "wolf",
];

#[rustfmt::skip]
const VERBS: [&str; 32] = [
    "braves", "builds", "carries", "carves", "climbs", "crosses", "drifts", "explores",
    "finds", "flows", "follows", "gathers", "glides", "guards", "holds", "leaps",
    "listens", "mends", "rests", "rises", "roams", "runs", "sails", "seeks",
    "settles", "shines", "sings", "soars", "stands", "turns", "wanders", "watches",
];

#[rustfmt::skip]
const ADVERBS: [&str; 32] = [
    "boldly", "briskly", "calmly", "deftly", "dimly", "early", "easily", "fondly",
    "freely", "gently", "gladly", "keenly", "kindly", "lightly", "loudly", "neatly",
    "nimbly", "openly", "plainly", "proudly", "quickly", "quietly", "safely", "sharply",
    "slowly", "softly", "soundly", "surely", "swiftly", "truly", "warmly", "wisely",
];

/// derives the human-memorable seal name for a commit hash
///
/// pure: the same hash always yields the same name. the first four
/// bytes index the word lists; the suffix is the first eight hex
/// characters of the hash
pub fn seal_name(oid: Oid) -> String {
    let bytes = oid.as_bytes();
    format!(
        "{}-{}-{}-{}-{}",
        ADJECTIVES[bytes[0] as usize % ADJECTIVES.len()],
        NOUNS[bytes[1] as usize % NOUNS.len()],
        VERBS[bytes[2] as usize % VERBS.len()],
        ADVERBS[bytes[3] as usize % ADVERBS.len()],
        hex::encode(&bytes[0..4]),
    )
}
