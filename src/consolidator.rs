use std::collections::BTreeMap;

use crate::rpm::RpmPackageInfo;
use crate::vercmp::Evr;

/// Collapses multiple occurrences of a `(name, arch)` pair to the one
/// carrying the largest `(epoch, version, release)`.
pub struct PackageSetConsolidator<T> {
    // arch -> name -> retained value
    map: BTreeMap<String, BTreeMap<String, (Evr, T)>>,
}

impl<T> Default for PackageSetConsolidator<T> {
    fn default() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }
}

impl<T> PackageSetConsolidator<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, info: &RpmPackageInfo, value: T) {
        let evr = Evr::new(info.epoch, &info.version, &info.release);
        let names = self.map.entry(info.arch.clone()).or_default();
        match names.get_mut(&info.name) {
            None => {
                names.insert(info.name.clone(), (evr, value));
            }
            Some(current) => {
                if current.0 < evr {
                    *current = (evr, value);
                }
            }
        }
    }

    /// Survivors in a stable (arch, name) order.
    pub fn values(self) -> Vec<T> {
        self.map
            .into_values()
            .flat_map(|names| names.into_values().map(|(_, value)| value))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpm::PackageKind;

    fn info(name: &str, arch: &str, epoch: Option<i32>, version: &str, release: &str) -> RpmPackageInfo {
        RpmPackageInfo {
            name: name.to_owned(),
            epoch,
            version: version.to_owned(),
            release: release.to_owned(),
            arch: arch.to_owned(),
            source_rpm: String::new(),
            build_time: 0,
            build_host: String::new(),
            summary: String::new(),
            description: String::new(),
            license: String::new(),
            group: String::new(),
            hash: String::new(),
            kind: PackageKind::Binary,
        }
    }

    #[test]
    fn test_keeps_largest_version() {
        let mut psc = PackageSetConsolidator::new();
        psc.add(&info("glibc", "x86_64", None, "2.34", "1"), 1);
        psc.add(&info("glibc", "x86_64", None, "2.35", "1"), 2);
        psc.add(&info("glibc", "x86_64", None, "2.35", "0.9"), 3);
        assert_eq!(psc.values(), vec![2]);
    }

    #[test]
    fn test_epoch_wins_over_version() {
        let mut psc = PackageSetConsolidator::new();
        psc.add(&info("kernel", "x86_64", None, "6.0", "1"), 1);
        psc.add(&info("kernel", "x86_64", Some(1), "1.0", "1"), 2);
        assert_eq!(psc.values(), vec![2]);
    }

    #[test]
    fn test_arch_keys_are_independent() {
        let mut psc = PackageSetConsolidator::new();
        psc.add(&info("glibc", "i686", None, "2.35", "1"), 1);
        psc.add(&info("glibc", "x86_64", None, "2.34", "1"), 2);
        psc.add(&info("bash", "x86_64", None, "5.0", "1"), 3);
        assert_eq!(psc.values(), vec![1, 3, 2]);
    }

    #[test]
    fn test_insertion_order_does_not_matter() {
        let mut a = PackageSetConsolidator::new();
        a.add(&info("pkg", "noarch", None, "1.0~rc1", "1"), 1);
        a.add(&info("pkg", "noarch", None, "1.0", "1"), 2);
        let mut b = PackageSetConsolidator::new();
        b.add(&info("pkg", "noarch", None, "1.0", "1"), 2);
        b.add(&info("pkg", "noarch", None, "1.0~rc1", "1"), 1);
        assert_eq!(a.values(), b.values());
    }
}
