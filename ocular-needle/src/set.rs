use anyhow::Result;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::debug;

use crate::needle::{Needle, NeedleRepo};

/// Tag-indexed view over the needle database with reload-on-demand.
pub struct NeedleSet {
    repo: Box<dyn NeedleRepo>,
    all: Vec<Arc<Needle>>,
    by_tag: HashMap<String, Vec<Arc<Needle>>>,
}

impl NeedleSet {
    pub fn new(repo: Box<dyn NeedleRepo>) -> Result<Self> {
        let mut set = Self {
            repo,
            all: Vec::new(),
            by_tag: HashMap::new(),
        };
        set.reload()?;
        Ok(set)
    }

    /// Re-read the needle database and rebuild the tag index.
    pub fn reload(&mut self) -> Result<()> {
        self.all = self.repo.load()?;
        self.by_tag.clear();
        for needle in &self.all {
            for tag in &needle.tags {
                self.by_tag
                    .entry(tag.clone())
                    .or_default()
                    .push(Arc::clone(needle));
            }
        }
        debug!(
            needles = self.all.len(),
            tags = self.by_tag.len(),
            "Needle index rebuilt"
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }

    /// Sorted, deduplicated copy of the requested tag atoms.
    pub fn normalize_tags(atoms: &[String]) -> Vec<String> {
        let mut tags: Vec<String> = atoms.to_vec();
        tags.sort();
        tags.dedup();
        tags
    }

    /// Expand tag atoms into the needles they select.
    ///
    /// An atom selects every needle carrying it as a tag, plus a needle of
    /// that exact name. Tags of selected needles join the frontier, so tag
    /// groups may pull in further groups; expansion stops when a pass adds
    /// no new needle (BFS over tags).
    pub fn needles_for(&self, atoms: &[String]) -> Vec<Arc<Needle>> {
        let mut queue: VecDeque<String> = atoms.iter().cloned().collect();
        let mut seen_tags: HashSet<String> = HashSet::new();
        let mut seen_needles: HashSet<String> = HashSet::new();
        let mut needles: Vec<Arc<Needle>> = Vec::new();

        let take = |needle: &Arc<Needle>,
                        seen_needles: &mut HashSet<String>,
                        queue: &mut VecDeque<String>,
                        needles: &mut Vec<Arc<Needle>>| {
            if seen_needles.insert(needle.name.clone()) {
                queue.extend(needle.tags.iter().cloned());
                needles.push(Arc::clone(needle));
            }
        };

        while let Some(tag) = queue.pop_front() {
            if !seen_tags.insert(tag.clone()) {
                continue;
            }
            if let Some(tagged) = self.by_tag.get(&tag) {
                for needle in tagged {
                    take(needle, &mut seen_needles, &mut queue, &mut needles);
                }
            }
            if let Some(named) = self.all.iter().find(|n| n.name == tag) {
                take(named, &mut seen_needles, &mut queue, &mut needles);
            }
        }

        needles
    }
}
