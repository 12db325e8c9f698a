use std::cmp::Ordering;

fn is_version_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'~' || b == b'^'
}

/// RPM's version segment comparison: digit and letter runs compared
/// segment-wise, separators ignored, `~` sorting before everything
/// (pre-release) and `^` after the bare version (post-release).
pub fn rpmvercmp(a: &str, b: &str) -> Ordering {
    let mut one = a.as_bytes();
    let mut two = b.as_bytes();

    while !one.is_empty() || !two.is_empty() {
        while let Some((&first, rest)) = one.split_first() {
            if is_version_char(first) {
                break;
            }
            one = rest;
        }
        while let Some((&first, rest)) = two.split_first() {
            if is_version_char(first) {
                break;
            }
            two = rest;
        }

        let tilde1 = one.first() == Some(&b'~');
        let tilde2 = two.first() == Some(&b'~');
        if tilde1 || tilde2 {
            if !tilde1 {
                return Ordering::Greater;
            }
            if !tilde2 {
                return Ordering::Less;
            }
            one = &one[1..];
            two = &two[1..];
            continue;
        }

        let caret1 = one.first() == Some(&b'^');
        let caret2 = two.first() == Some(&b'^');
        if caret1 || caret2 {
            // A caret suffix sorts after the bare version but before
            // any longer plain suffix.
            if one.is_empty() {
                return Ordering::Less;
            }
            if two.is_empty() {
                return Ordering::Greater;
            }
            if !caret1 {
                return Ordering::Greater;
            }
            if !caret2 {
                return Ordering::Less;
            }
            one = &one[1..];
            two = &two[1..];
            continue;
        }

        if one.is_empty() || two.is_empty() {
            break;
        }

        let numeric = one[0].is_ascii_digit();
        let split = |s: &[u8]| -> usize {
            s.iter()
                .position(|&c| {
                    if numeric {
                        !c.is_ascii_digit()
                    } else {
                        !c.is_ascii_alphabetic()
                    }
                })
                .unwrap_or(s.len())
        };
        let (seg1, rest1) = one.split_at(split(one));
        let (seg2, rest2) = two.split_at(split(two));

        if numeric {
            if seg2.is_empty() {
                // Numeric segments are newer than alphabetic ones.
                return Ordering::Greater;
            }
            let trimmed1 = trim_leading_zeros(seg1);
            let trimmed2 = trim_leading_zeros(seg2);
            match trimmed1.len().cmp(&trimmed2.len()).then(trimmed1.cmp(trimmed2)) {
                Ordering::Equal => {}
                other => return other,
            }
        } else {
            if seg2.is_empty() {
                return Ordering::Less;
            }
            match seg1.cmp(seg2) {
                Ordering::Equal => {}
                other => return other,
            }
        }
        one = rest1;
        two = rest2;
    }

    if one.is_empty() && two.is_empty() {
        Ordering::Equal
    } else if one.is_empty() {
        Ordering::Less
    } else {
        Ordering::Greater
    }
}

fn trim_leading_zeros(s: &[u8]) -> &[u8] {
    let start = s.iter().position(|&c| c != b'0').unwrap_or(s.len());
    &s[start..]
}

/// Epoch, version and release with RPM precedence. A missing epoch
/// counts as zero.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Evr {
    pub epoch: Option<i32>,
    pub version: String,
    pub release: String,
}

impl Evr {
    pub fn new(epoch: Option<i32>, version: &str, release: &str) -> Self {
        Self {
            epoch,
            version: version.to_owned(),
            release: release.to_owned(),
        }
    }
}

impl PartialOrd for Evr {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Evr {
    fn cmp(&self, other: &Self) -> Ordering {
        self.epoch
            .unwrap_or(0)
            .cmp(&other.epoch.unwrap_or(0))
            .then_with(|| rpmvercmp(&self.version, &other.version))
            .then_with(|| rpmvercmp(&self.release, &other.release))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn less(a: &str, b: &str) {
        assert_eq!(rpmvercmp(a, b), Ordering::Less, "{} < {}", a, b);
        assert_eq!(rpmvercmp(b, a), Ordering::Greater, "{} > {}", b, a);
    }

    fn equal(a: &str, b: &str) {
        assert_eq!(rpmvercmp(a, b), Ordering::Equal, "{} == {}", a, b);
    }

    #[test]
    fn test_basic_ordering() {
        equal("1.0", "1.0");
        equal("1.0", "1_0");
        less("1", "1.0");
        less("1.0", "1.0.1");
        less("1.0", "1.0a");
        less("1.9", "1.10");
        less("2.0", "10.0");
        equal("007", "7");
        less("1.0a", "1.0.1");
        less("a", "1");
    }

    #[test]
    fn test_tilde() {
        less("1~rc1", "1");
        less("1.0~beta", "1.0");
        less("1.0~~", "1.0~");
        less("1.0~rc1", "1.0~rc2");
        // Tilde semantics hold across separators.
        less("1.0.~rc1", "1.0");
    }

    #[test]
    fn test_caret() {
        less("1.0", "1.0^20210101");
        less("1.0^20210101", "1.0^20210102");
        less("1.0^", "1.0.1");
        less("1.0~post", "1.0^post");
    }

    #[test]
    fn test_evr_precedence() {
        assert!(Evr::new(None, "2.0", "1") < Evr::new(Some(1), "1.0", "1"));
        assert!(Evr::new(None, "1.0", "1") == Evr::new(Some(0), "1.0", "1"));
        assert!(Evr::new(None, "1.0", "1") < Evr::new(None, "1.0", "2"));
        assert!(Evr::new(None, "1.2", "1") > Evr::new(None, "1.1", "9"));
    }
}
