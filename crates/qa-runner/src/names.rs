//! Identity allocation: instance names, run tags and cluster IPs.

use crate::config::ClusterConfig;
use crate::error::{QaError, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::BTreeSet;

/// Rejected samples allowed for a single name slot before giving up.
pub const MAX_ATTEMPTS_PER_NAME: usize = 40;

pub const INSTANCE_NAMES: &[&str] = &[
    "bart",
    "lisa",
    "homer",
    "marge",
    "maggie",
    "milhouse",
    "krusty",
    "frink",
    "kodos",
    "kang",
    "grandpa",
    "moe",
    "mr-burns",
    "smithers",
    "flanders",
    "radioactive-man",
    "maude-flanders",
    "lenny",
    "carl",
    "willy",
    "barney",
    "blinky",
    "bumble-bee-man",
    "patty",
    "selma",
    "kent-brockman",
    "duffman",
    "fat-tony",
    "fallout-boy",
    "rod-flanders",
    "todd-flanders",
    "herman",
    "julius-hibbert",
    "lionel-hutz",
    "itchy",
    "scratchy",
    "timothy-lovejoy",
    "otto",
    "mcbain",
    "troy-mcclure",
    "nelson-muntz",
    "jimbo-jones",
    "dolph-starbeam",
    "apu",
    "sideshow-bob",
    "major-quimby",
    "principal-skinner",
    "snake",
    "clancy-wiggum",
    "ralph-wiggum",
    "cletus",
    "spider-pig",
    "disco-stu",
];

pub const ADJECTIVES: &[&str] = &[
    "abnormal", "agile", "amazing", "ambitious", "amusing", "artistic", "average", "awesome",
    "awful", "balanced", "beautiful", "blunt", "brave", "bright", "brilliant", "candid",
    "capable", "careful", "careless", "cautious", "charming", "cheerful", "childish", "civil",
    "clean", "clever", "clumsy", "coherent", "cold", "competent", "composed", "confident",
    "confused", "cordial", "crafty", "cranky", "crass", "critical", "cruel", "curious",
    "cynical", "dainty", "decisive", "delicate", "demonic", "devoted", "direct", "discreet",
    "distant", "dramatic", "drowsy", "drunk", "dull", "dutiful", "eager", "earnest",
    "efficient", "emotional", "energetic", "evasive", "fabulous", "fervent", "flaky",
    "friendly", "funny", "generous", "gentle", "gloomy", "grave", "great", "groggy",
    "hateful", "helpful", "hesitant", "idiotic", "idle", "impulsive", "inactive", "inventive",
    "keen", "kind", "lame", "lazy", "lean", "lethargic", "lively", "logical", "lovable",
    "lovely", "mature", "mean", "mild", "modest", "naive", "nasty", "natural", "negative",
    "nervous", "noisy", "normal", "nosy", "numb", "passive", "plain", "playful", "pleasant",
    "plucky", "polite", "popular", "positive", "powerful", "pretty", "proud", "prudent",
    "punctual", "quick", "quiet", "realistic", "sad", "sassy", "selfish", "sensible", "shy",
    "silly", "sincere", "sleepy", "sloppy", "slow", "smart", "snobby", "sober", "stable",
    "steady", "stoic", "striking", "strong", "stupid", "sturdy", "subtle", "sulky", "sullen",
    "surly", "sweet", "tactful", "tactless", "talented", "timid", "tired", "tolerant",
    "touchy", "ugly", "unsure", "vigilant", "warm", "wary", "weak", "willing", "wonderful",
    "zealous",
];

fn pick<'a, R: Rng + ?Sized>(rng: &mut R, vocabulary: &[&'a str]) -> &'a str {
    vocabulary.choose(rng).copied().unwrap_or("unnamed")
}

/// Sample `count` distinct fully-qualified names that `exists` does not
/// report as taken.
///
/// Names are drawn without replacement from a shuffled vocabulary, so a
/// rejected or already chosen name is never offered twice. A slot fails after
/// [`MAX_ATTEMPTS_PER_NAME`] existing names in a row, or when the vocabulary
/// runs dry. Errors from `exists` are returned unchanged.
pub fn allocate_instance_names<R, F>(
    rng: &mut R,
    count: usize,
    domain: &str,
    mut exists: F,
) -> Result<Vec<String>>
where
    R: Rng + ?Sized,
    F: FnMut(&str) -> Result<bool>,
{
    let mut vocabulary = INSTANCE_NAMES.to_vec();
    vocabulary.shuffle(rng);
    let mut candidates = vocabulary.into_iter();

    let mut names: Vec<String> = Vec::with_capacity(count);
    for slot in 0..count {
        let mut attempts = 0;
        loop {
            if attempts == MAX_ATTEMPTS_PER_NAME {
                return Err(QaError::AllocationExhausted { slot, attempts });
            }
            let Some(short) = candidates.next() else {
                return Err(QaError::AllocationExhausted { slot, attempts });
            };
            let fqdn = format!("{}.{}", short, domain);
            if exists(&fqdn)? {
                attempts += 1;
                continue;
            }
            names.push(fqdn);
            break;
        }
    }
    Ok(names)
}

/// `adjective-name`. Uniqueness is checked by the run store on insert.
pub fn allocate_tag<R: Rng + ?Sized>(rng: &mut R) -> String {
    format!("{}-{}", pick(rng, ADJECTIVES), pick(rng, INSTANCE_NAMES))
}

/// A contiguous range of host addresses inside one /24.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpPool {
    prefix: String,
    first: u8,
    last: u8,
}

impl IpPool {
    pub fn new(prefix: impl Into<String>, first: u8, last: u8) -> Self {
        Self {
            prefix: prefix.into(),
            first,
            last,
        }
    }

    pub fn address(&self, host: u8) -> String {
        format!("{}{}", self.prefix, host)
    }

    pub fn len(&self) -> usize {
        if self.first > self.last {
            0
        } else {
            usize::from(self.last - self.first) + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, ip: &str) -> bool {
        ip.strip_prefix(self.prefix.as_str())
            .and_then(|host| host.parse::<u8>().ok())
            .map(|host| host >= self.first && host <= self.last)
            .unwrap_or(false)
    }
}

impl From<&ClusterConfig> for IpPool {
    fn from(cfg: &ClusterConfig) -> Self {
        IpPool::new(cfg.ip_prefix.clone(), cfg.ip_first, cfg.ip_last)
    }
}

/// Lowest address of `pool` not present in `active_ips`.
pub fn allocate_cluster_ip(pool: &IpPool, active_ips: &BTreeSet<String>) -> Result<String> {
    if !pool.is_empty() {
        for host in pool.first..=pool.last {
            let ip = pool.address(host);
            if !active_ips.contains(&ip) {
                return Ok(ip);
            }
        }
    }
    Err(QaError::PoolExhausted {
        first: pool.address(pool.first),
        last: pool.address(pool.last),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(0x9a7e)
    }

    #[test]
    fn instance_names_are_distinct_and_fully_qualified() {
        let mut rng = rng();
        let names = allocate_instance_names(&mut rng, 10, "staging.example.org", |_| Ok(false))
            .expect("allocation");
        assert_eq!(names.len(), 10);
        let unique: HashSet<_> = names.iter().collect();
        assert_eq!(unique.len(), 10);
        for name in &names {
            let short = name
                .strip_suffix(".staging.example.org")
                .expect("domain suffix");
            assert!(INSTANCE_NAMES.contains(&short), "unexpected name {}", name);
        }
    }

    #[test]
    fn instance_names_skip_existing_hosts() {
        let mut rng = rng();
        let taken: HashSet<String> = INSTANCE_NAMES
            .iter()
            .take(MAX_ATTEMPTS_PER_NAME - 10)
            .map(|n| format!("{}.d", n))
            .collect();
        let mut checks = 0;
        let names = allocate_instance_names(&mut rng, 3, "d", |fqdn| {
            checks += 1;
            Ok(taken.contains(fqdn))
        })
        .expect("enough names are still free");
        assert_eq!(names.len(), 3);
        assert!(names.iter().all(|n| !taken.contains(n)));
        assert!(checks <= taken.len() + 3);
    }

    #[test]
    fn whole_vocabulary_can_be_allocated() {
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let names = allocate_instance_names(&mut rng, INSTANCE_NAMES.len(), "d", |_| Ok(false))
                .unwrap_or_else(|e| panic!("seed {}: {}", seed, e));
            let unique: HashSet<_> = names.iter().collect();
            assert_eq!(unique.len(), INSTANCE_NAMES.len(), "seed {}", seed);
        }
    }

    #[test]
    fn every_name_existing_exhausts_after_exact_attempt_budget() {
        let mut rng = rng();
        let mut checks = 0;
        let err = allocate_instance_names(&mut rng, 3, "d", |_| {
            checks += 1;
            Ok(true)
        })
        .expect_err("must exhaust");
        assert_eq!(checks, MAX_ATTEMPTS_PER_NAME);
        match err {
            QaError::AllocationExhausted { slot, attempts } => {
                assert_eq!(slot, 0);
                assert_eq!(attempts, MAX_ATTEMPTS_PER_NAME);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn requesting_more_than_vocabulary_fails() {
        let mut rng = rng();
        let err = allocate_instance_names(&mut rng, INSTANCE_NAMES.len() + 1, "d", |_| Ok(false))
            .expect_err("cannot exceed vocabulary");
        assert!(matches!(err, QaError::AllocationExhausted { .. }));
    }

    #[test]
    fn existence_check_errors_propagate() {
        let mut rng = rng();
        let err = allocate_instance_names(&mut rng, 1, "d", |_| {
            Err(QaError::remote("query", "instance", "boom"))
        })
        .expect_err("propagates");
        assert!(matches!(err, QaError::RemoteOperationFailed { .. }));
    }

    #[test]
    fn tags_join_adjective_and_name() {
        let mut rng = rng();
        for _ in 0..20 {
            let tag = allocate_tag(&mut rng);
            let (adj, name) = tag.split_once('-').expect("dash");
            assert!(ADJECTIVES.contains(&adj));
            assert!(INSTANCE_NAMES.contains(&name), "unexpected tag {}", tag);
        }
    }

    #[test]
    fn cluster_ip_is_lowest_free_address() {
        let pool = IpPool::new("192.168.1.", 240, 253);
        let mut active = BTreeSet::new();
        assert_eq!(allocate_cluster_ip(&pool, &active).unwrap(), "192.168.1.240");

        active.insert("192.168.1.240".to_string());
        active.insert("192.168.1.242".to_string());
        assert_eq!(allocate_cluster_ip(&pool, &active).unwrap(), "192.168.1.241");

        // Addresses outside the pool do not occupy it.
        active.insert("10.0.0.1".to_string());
        let ip = allocate_cluster_ip(&pool, &active).unwrap();
        assert!(pool.contains(&ip));
        assert!(!active.contains(&ip));
    }

    #[test]
    fn cluster_ip_pool_exhaustion() {
        let pool = IpPool::new("10.1.2.", 5, 7);
        let active: BTreeSet<String> = (5..=7).map(|h| pool.address(h)).collect();
        let err = allocate_cluster_ip(&pool, &active).expect_err("exhausted");
        match err {
            QaError::PoolExhausted { first, last } => {
                assert_eq!(first, "10.1.2.5");
                assert_eq!(last, "10.1.2.7");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn pool_membership() {
        let pool = IpPool::new("192.168.1.", 240, 253);
        assert_eq!(pool.len(), 14);
        assert!(pool.contains("192.168.1.253"));
        assert!(!pool.contains("192.168.1.254"));
        assert!(!pool.contains("192.168.10.240"));
    }
}
