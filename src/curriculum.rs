use std::collections::{BTreeSet, HashMap, HashSet};

use crate::error::ReportError;
use crate::models::{Competency, Domain, SubCompetency};

#[derive(Debug, Clone, Copy)]
struct Location {
    domain: usize,
    competency: usize,
    sub: usize,
}

/// A validated domain → competency → sub-competency tree.
///
/// Domains are held in presentation order (ascending `ordering`, then id).
/// Construction checks that every back-reference matches its parent, that ids
/// are unique and that every prerequisite names a known sub-competency.
/// Cycle detection is deferred to [`Curriculum::evaluation_order`].
#[derive(Debug, Clone)]
pub struct Curriculum {
    domains: Vec<Domain>,
    positions: Vec<Location>,
    index: HashMap<String, usize>,
}

impl Curriculum {
    pub fn new(mut domains: Vec<Domain>) -> Result<Self, ReportError> {
        domains.sort_by(|a, b| a.ordering.cmp(&b.ordering).then_with(|| a.id.cmp(&b.id)));

        let mut domain_ids = HashSet::new();
        let mut competency_ids = HashSet::new();
        let mut positions = Vec::new();
        let mut index = HashMap::new();

        for (d, domain) in domains.iter().enumerate() {
            if !domain_ids.insert(domain.id.as_str()) {
                return Err(integrity(format!("duplicate domain id '{}'", domain.id)));
            }
            for (c, competency) in domain.competencies.iter().enumerate() {
                if competency.domain_id != domain.id {
                    return Err(integrity(format!(
                        "competency '{}' references domain '{}' but is listed under '{}'",
                        competency.id, competency.domain_id, domain.id
                    )));
                }
                if !competency_ids.insert(competency.id.as_str()) {
                    return Err(integrity(format!(
                        "duplicate competency id '{}'",
                        competency.id
                    )));
                }
                for (s, sub) in competency.sub_competencies.iter().enumerate() {
                    if sub.competency_id != competency.id {
                        return Err(integrity(format!(
                            "sub-competency '{}' references competency '{}' but is listed under '{}'",
                            sub.id, sub.competency_id, competency.id
                        )));
                    }
                    if index.insert(sub.id.clone(), positions.len()).is_some() {
                        return Err(integrity(format!(
                            "duplicate sub-competency id '{}'",
                            sub.id
                        )));
                    }
                    positions.push(Location {
                        domain: d,
                        competency: c,
                        sub: s,
                    });
                }
            }
        }

        let curriculum = Self {
            domains,
            positions,
            index,
        };

        for sub in curriculum.sub_competencies() {
            if let Some(missing) = sub
                .prerequisites
                .iter()
                .find(|p| !curriculum.index.contains_key(p.as_str()))
            {
                return Err(integrity(format!(
                    "sub-competency '{}' requires unknown sub-competency '{}'",
                    sub.id, missing
                )));
            }
        }

        Ok(curriculum)
    }

    pub fn domains(&self) -> &[Domain] {
        &self.domains
    }

    pub fn domain(&self, id: &str) -> Option<&Domain> {
        self.domains.iter().find(|d| d.id == id)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn contains(&self, sub_competency_id: &str) -> bool {
        self.index.contains_key(sub_competency_id)
    }

    pub fn sub_competency(&self, id: &str) -> Option<&SubCompetency> {
        self.index.get(id).map(|&i| self.at(i))
    }

    pub fn competency_of(&self, sub_competency_id: &str) -> Option<&Competency> {
        self.index.get(sub_competency_id).map(|&i| {
            let loc = self.positions[i];
            &self.domains[loc.domain].competencies[loc.competency]
        })
    }

    pub fn domain_of(&self, sub_competency_id: &str) -> Option<&Domain> {
        self.index
            .get(sub_competency_id)
            .map(|&i| &self.domains[self.positions[i].domain])
    }

    /// Sub-competencies in curriculum order.
    pub fn sub_competencies(&self) -> impl Iterator<Item = &SubCompetency> {
        (0..self.positions.len()).map(move |i| self.at(i))
    }

    /// Topological order over the prerequisite graph.
    ///
    /// Every sub-competency appears after all of its prerequisites. Among
    /// those ready at the same time, curriculum order decides, so the result
    /// is deterministic. A cycle (including a self-prerequisite) is a
    /// `CurriculumIntegrity` error naming the sub-competencies left unordered.
    pub fn evaluation_order(&self) -> Result<Vec<&SubCompetency>, ReportError> {
        let n = self.positions.len();
        let mut pending = vec![0usize; n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];

        for (i, sub) in self.sub_competencies().enumerate() {
            let distinct: HashSet<&str> = sub.prerequisites.iter().map(String::as_str).collect();
            for prereq in distinct {
                let p = self.index[prereq];
                dependents[p].push(i);
                pending[i] += 1;
            }
        }

        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| pending[i] == 0).collect();
        let mut order = Vec::with_capacity(n);

        while let Some(i) = ready.pop_first() {
            order.push(self.at(i));
            for &dep in &dependents[i] {
                pending[dep] -= 1;
                if pending[dep] == 0 {
                    ready.insert(dep);
                }
            }
        }

        if order.len() < n {
            let mut stuck: Vec<&str> = (0..n)
                .filter(|&i| pending[i] > 0)
                .map(|i| self.at(i).id.as_str())
                .collect();
            stuck.sort_unstable();
            return Err(integrity(format!(
                "prerequisite cycle involving: {}",
                stuck.join(", ")
            )));
        }

        Ok(order)
    }

    fn at(&self, i: usize) -> &SubCompetency {
        let loc = self.positions[i];
        &self.domains[loc.domain].competencies[loc.competency].sub_competencies[loc.sub]
    }
}

fn integrity(msg: String) -> ReportError {
    ReportError::CurriculumIntegrity(msg)
}
