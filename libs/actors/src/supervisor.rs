//! Supervision Tree
//!
//! Pool-local parent/child relations keyed by uid. The tree only decides;
//! the pool applies the resulting actions to the actors themselves.
//!
//! Resolution of a failure:
//! - `Restart` restarts the actor unless its restart intensity is exceeded,
//!   in which case it is stopped
//! - `Stop` stops it
//! - `Escalate` resolves the parent's policy as if the parent had failed;
//!   escalating past the root resolves to `Stop`
//!
//! The target's children with `OnParentExit::Follow` receive the same
//! action, recursively; `Detach` children are moved to the root.

use oscar_network::{ActorUid, OnParentExit, RestartPolicy};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Action the pool applies to one actor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorAction {
    Restart,
    Stop,
}

/// Restart intensity: at most `max_restarts` within `window`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartLimit {
    pub max_restarts: u32,
    pub window: Duration,
}

impl Default for RestartLimit {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct RestartWindow {
    window_start: Option<Instant>,
    count: u32,
}

impl RestartWindow {
    /// Count one restart at `now`; false once the limit is exceeded
    fn should_restart(&mut self, limit: &RestartLimit, now: Instant) -> bool {
        match self.window_start {
            Some(start) if now.duration_since(start) <= limit.window => {
                self.count += 1;
                self.count <= limit.max_restarts
            }
            _ => {
                self.window_start = Some(now);
                self.count = 1;
                self.count <= limit.max_restarts
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisionNode {
    pub uid: ActorUid,
    /// `None` is the pool root
    pub parent: Option<ActorUid>,
    pub children: Vec<ActorUid>,
    pub restart_policy: RestartPolicy,
    pub on_parent_exit: OnParentExit,
    restarts: RestartWindow,
}

#[derive(Debug, Default)]
pub struct SupervisionTree {
    nodes: HashMap<ActorUid, SupervisionNode>,
    limit: RestartLimit,
}

impl SupervisionTree {
    pub fn new(limit: RestartLimit) -> Self {
        Self {
            nodes: HashMap::new(),
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, uid: &ActorUid) -> bool {
        self.nodes.contains_key(uid)
    }

    pub fn node(&self, uid: &ActorUid) -> Option<&SupervisionNode> {
        self.nodes.get(uid)
    }

    pub fn parent(&self, uid: &ActorUid) -> Option<&ActorUid> {
        self.nodes.get(uid).and_then(|n| n.parent.as_ref())
    }

    pub fn children(&self, uid: &ActorUid) -> &[ActorUid] {
        self.nodes.get(uid).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    /// Add a node under `parent` (or the root); false if the parent is unknown
    pub fn insert(
        &mut self,
        uid: ActorUid,
        parent: Option<ActorUid>,
        restart_policy: RestartPolicy,
        on_parent_exit: OnParentExit,
    ) -> bool {
        if let Some(parent) = &parent {
            match self.nodes.get_mut(parent) {
                Some(node) => node.children.push(uid.clone()),
                None => return false,
            }
        }
        self.nodes.insert(
            uid.clone(),
            SupervisionNode {
                uid,
                parent,
                children: Vec::new(),
                restart_policy,
                on_parent_exit,
                restarts: RestartWindow::default(),
            },
        );
        true
    }

    /// Decide what happens after `uid`'s handler failed
    ///
    /// Stopped actors are removed from the tree. The failing actor is always
    /// part of the returned plan.
    pub fn on_failure(&mut self, uid: &ActorUid, now: Instant) -> Vec<(ActorUid, SupervisorAction)> {
        if !self.nodes.contains_key(uid) {
            return vec![(uid.clone(), SupervisorAction::Stop)];
        }

        let (target, action) = self.resolve(uid, now);
        let mut plan = Vec::new();
        self.expand(&target, action, &mut plan);

        if !plan.iter().any(|(u, _)| u == uid) {
            // The failing actor detached on the way up; it still gets the action
            self.expand(uid, action, &mut plan);
        }

        if action == SupervisorAction::Stop {
            for (stopped, _) in &plan {
                self.remove(stopped);
            }
        }
        plan
    }

    /// Remove `uid` and the children that follow it
    ///
    /// Returns the removed uids, parents before children.
    pub fn on_stop(&mut self, uid: &ActorUid) -> Vec<ActorUid> {
        if !self.nodes.contains_key(uid) {
            return Vec::new();
        }
        let mut plan = Vec::new();
        self.expand(uid, SupervisorAction::Stop, &mut plan);
        let removed: Vec<ActorUid> = plan.into_iter().map(|(u, _)| u).collect();
        for stopped in &removed {
            self.remove(stopped);
        }
        removed
    }

    fn resolve(&mut self, uid: &ActorUid, now: Instant) -> (ActorUid, SupervisorAction) {
        let limit = self.limit;
        let mut current = uid.clone();
        loop {
            let Some(node) = self.nodes.get_mut(&current) else {
                return (current, SupervisorAction::Stop);
            };
            match node.restart_policy {
                RestartPolicy::Restart => {
                    let action = if node.restarts.should_restart(&limit, now) {
                        SupervisorAction::Restart
                    } else {
                        SupervisorAction::Stop
                    };
                    return (current, action);
                }
                RestartPolicy::Stop => return (current, SupervisorAction::Stop),
                RestartPolicy::Escalate => match node.parent.clone() {
                    Some(parent) => current = parent,
                    None => return (current, SupervisorAction::Stop),
                },
            }
        }
    }

    /// Collect `uid` and following descendants; detach the others
    fn expand(&mut self, uid: &ActorUid, action: SupervisorAction, plan: &mut Vec<(ActorUid, SupervisorAction)>) {
        let mut stack = vec![uid.clone()];
        while let Some(current) = stack.pop() {
            if plan.iter().any(|(u, _)| *u == current) {
                continue;
            }
            plan.push((current.clone(), action));

            let children = self.children(&current).to_vec();
            for child in children {
                match self.nodes.get(&child).map(|n| n.on_parent_exit) {
                    Some(OnParentExit::Follow) => stack.push(child),
                    Some(OnParentExit::Detach) => self.detach(&child),
                    None => {}
                }
            }
        }
    }

    fn detach(&mut self, uid: &ActorUid) {
        let Some(parent) = self.nodes.get_mut(uid).and_then(|n| n.parent.take()) else {
            return;
        };
        if let Some(node) = self.nodes.get_mut(&parent) {
            node.children.retain(|c| c != uid);
        }
    }

    fn remove(&mut self, uid: &ActorUid) {
        self.detach(uid);
        if let Some(node) = self.nodes.remove(uid) {
            for child in node.children {
                if let Some(child) = self.nodes.get_mut(&child) {
                    child.parent = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(s: &str) -> ActorUid {
        ActorUid::new(s)
    }

    fn tree() -> SupervisionTree {
        SupervisionTree::new(RestartLimit {
            max_restarts: 2,
            window: Duration::from_secs(10),
        })
    }

    #[test]
    fn test_insert_requires_known_parent() {
        let mut tree = tree();
        assert!(tree.insert(uid("a"), None, RestartPolicy::Stop, OnParentExit::Follow));
        assert!(!tree.insert(uid("b"), Some(uid("ghost")), RestartPolicy::Stop, OnParentExit::Follow));
        assert!(tree.insert(uid("b"), Some(uid("a")), RestartPolicy::Stop, OnParentExit::Follow));
        assert_eq!(tree.children(&uid("a")), &[uid("b")]);
        assert_eq!(tree.parent(&uid("b")), Some(&uid("a")));
    }

    #[test]
    fn test_restart_with_following_children() {
        let mut tree = tree();
        tree.insert(uid("p"), None, RestartPolicy::Restart, OnParentExit::Follow);
        tree.insert(uid("c1"), Some(uid("p")), RestartPolicy::Stop, OnParentExit::Follow);
        tree.insert(uid("c2"), Some(uid("p")), RestartPolicy::Stop, OnParentExit::Detach);

        let plan = tree.on_failure(&uid("p"), Instant::now());
        assert_eq!(
            plan,
            vec![(uid("p"), SupervisorAction::Restart), (uid("c1"), SupervisorAction::Restart)]
        );
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.parent(&uid("c2")), None);
        assert_eq!(tree.children(&uid("p")), &[uid("c1")]);
    }

    #[test]
    fn test_restart_intensity_exceeded_resolves_to_stop() {
        let mut tree = tree();
        tree.insert(uid("a"), None, RestartPolicy::Restart, OnParentExit::Follow);
        let now = Instant::now();

        assert_eq!(tree.on_failure(&uid("a"), now)[0].1, SupervisorAction::Restart);
        assert_eq!(tree.on_failure(&uid("a"), now)[0].1, SupervisorAction::Restart);
        assert_eq!(tree.on_failure(&uid("a"), now)[0].1, SupervisorAction::Stop);
        assert!(!tree.contains(&uid("a")));
    }

    #[test]
    fn test_restart_window_resets() {
        let mut tree = tree();
        tree.insert(uid("a"), None, RestartPolicy::Restart, OnParentExit::Follow);
        let start = Instant::now();

        tree.on_failure(&uid("a"), start);
        tree.on_failure(&uid("a"), start);
        let later = start + Duration::from_secs(11);
        assert_eq!(tree.on_failure(&uid("a"), later)[0].1, SupervisorAction::Restart);
    }

    #[test]
    fn test_escalate_uses_parent_policy() {
        let mut tree = tree();
        tree.insert(uid("root"), None, RestartPolicy::Restart, OnParentExit::Follow);
        tree.insert(uid("mid"), Some(uid("root")), RestartPolicy::Escalate, OnParentExit::Follow);
        tree.insert(uid("leaf"), Some(uid("mid")), RestartPolicy::Escalate, OnParentExit::Follow);

        let plan = tree.on_failure(&uid("leaf"), Instant::now());
        assert_eq!(plan[0], (uid("root"), SupervisorAction::Restart));
        assert!(plan.contains(&(uid("mid"), SupervisorAction::Restart)));
        assert!(plan.contains(&(uid("leaf"), SupervisorAction::Restart)));
    }

    #[test]
    fn test_escalate_at_root_stops_subtree() {
        let mut tree = tree();
        tree.insert(uid("a"), None, RestartPolicy::Escalate, OnParentExit::Follow);
        tree.insert(uid("b"), Some(uid("a")), RestartPolicy::Stop, OnParentExit::Follow);

        let plan = tree.on_failure(&uid("a"), Instant::now());
        assert_eq!(plan, vec![(uid("a"), SupervisorAction::Stop), (uid("b"), SupervisorAction::Stop)]);
        assert!(tree.is_empty());
    }

    #[test]
    fn test_detached_escalating_child_still_gets_action() {
        let mut tree = tree();
        tree.insert(uid("p"), None, RestartPolicy::Stop, OnParentExit::Follow);
        tree.insert(uid("c"), Some(uid("p")), RestartPolicy::Escalate, OnParentExit::Detach);

        let plan = tree.on_failure(&uid("c"), Instant::now());
        assert!(plan.contains(&(uid("p"), SupervisorAction::Stop)));
        assert!(plan.contains(&(uid("c"), SupervisorAction::Stop)));
        assert!(tree.is_empty());
    }

    #[test]
    fn test_stop_cascades_to_followers_only() {
        let mut tree = tree();
        tree.insert(uid("p"), None, RestartPolicy::Stop, OnParentExit::Follow);
        tree.insert(uid("c"), Some(uid("p")), RestartPolicy::Stop, OnParentExit::Follow);
        tree.insert(uid("g"), Some(uid("c")), RestartPolicy::Stop, OnParentExit::Follow);
        tree.insert(uid("d"), Some(uid("p")), RestartPolicy::Stop, OnParentExit::Detach);

        let removed = tree.on_stop(&uid("p"));
        assert_eq!(removed, vec![uid("p"), uid("c"), uid("g")]);
        assert!(tree.contains(&uid("d")));
        assert_eq!(tree.parent(&uid("d")), None);
    }
}
