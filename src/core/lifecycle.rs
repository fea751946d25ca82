//! Deployment stages and the built-in steps inside them.
//!
//! Both stage names and step names are hook anchors:
//!
//! ```text
//! starting    check
//! updating    release:create, repo:update
//! publishing  symlink:shared
//! finishing   symlink:release, cleanup
//! finished    (hooks only)
//! ```

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Starting,
    Updating,
    Publishing,
    Finishing,
    Finished,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Starting,
        Stage::Updating,
        Stage::Publishing,
        Stage::Finishing,
        Stage::Finished,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Starting => "starting",
            Stage::Updating => "updating",
            Stage::Publishing => "publishing",
            Stage::Finishing => "finishing",
            Stage::Finished => "finished",
        }
    }

    pub fn steps(&self) -> &'static [Step] {
        match self {
            Stage::Starting => &[Step::Check],
            Stage::Updating => &[Step::ReleaseCreate, Step::RepoUpdate],
            Stage::Publishing => &[Step::SymlinkShared],
            Stage::Finishing => &[Step::SymlinkRelease, Step::Cleanup],
            Stage::Finished => &[],
        }
    }

    /// Execution order inside the stage: stage hooks around step hooks
    /// around each step's action.
    pub fn points(&self) -> Vec<Point> {
        let mut points = vec![Point::Hooks {
            anchor: self.as_str(),
            when: When::Before,
        }];
        for step in self.steps() {
            points.push(Point::Hooks {
                anchor: step.as_str(),
                when: When::Before,
            });
            points.push(Point::Action(*step));
            points.push(Point::Hooks {
                anchor: step.as_str(),
                when: When::After,
            });
        }
        points.push(Point::Hooks {
            anchor: self.as_str(),
            when: When::After,
        });
        points
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Check,
    ReleaseCreate,
    RepoUpdate,
    SymlinkShared,
    SymlinkRelease,
    Cleanup,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Check => "check",
            Step::ReleaseCreate => "release:create",
            Step::RepoUpdate => "repo:update",
            Step::SymlinkShared => "symlink:shared",
            Step::SymlinkRelease => "symlink:release",
            Step::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Before or after the anchor's built-in action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum When {
    Before,
    After,
}

impl When {
    pub fn as_str(&self) -> &'static str {
        match self {
            When::Before => "before",
            When::After => "after",
        }
    }
}

impl fmt::Display for When {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Point {
    Hooks { anchor: &'static str, when: When },
    Action(Step),
}

/// Every anchor name, in execution order.
pub fn known_anchors() -> Vec<&'static str> {
    let mut anchors = Vec::new();
    for stage in Stage::ALL {
        anchors.push(stage.as_str());
        anchors.extend(stage.steps().iter().map(|step| step.as_str()));
    }
    anchors
}

/// Canonical anchor name. Accepts an optional `deploy:` prefix
/// (`deploy:symlink:release` == `symlink:release`).
pub fn normalize_anchor(anchor: &str) -> Option<&'static str> {
    let trimmed = anchor.trim();
    let bare = trimmed.strip_prefix("deploy:").unwrap_or(trimmed);
    known_anchors().into_iter().find(|known| *known == bare)
}

/// Stage an anchor belongs to; a failing hook is reported against it.
pub fn stage_of(anchor: &str) -> Option<Stage> {
    let anchor = normalize_anchor(anchor)?;
    Stage::ALL.into_iter().find(|stage| {
        stage.as_str() == anchor || stage.steps().iter().any(|step| step.as_str() == anchor)
    })
}

/// Whether hooks at `anchor`/`when` run after `release:create`, i.e. with
/// `release_id` and `release_path` set.
pub fn release_known_at(anchor: &str, when: When) -> bool {
    let Some(anchor) = normalize_anchor(anchor) else {
        return false;
    };
    let mut created = false;
    for stage in Stage::ALL {
        for point in stage.points() {
            match point {
                Point::Action(Step::ReleaseCreate) => created = true,
                Point::Hooks { anchor: a, when: w } if a == anchor && w == when => {
                    return created;
                }
                _ => {}
            }
        }
    }
    false
}
