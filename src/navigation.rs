//! Directory navigation state machine.
//!
//! The navigation state is a stack of [`Level`]s, one per directory entered,
//! each with its listed entries and the selected position. [`transition`]
//! applies one [`Command`] and performs its side effects through
//! [`NavEffects`], so the machine itself never touches the pipeline and can
//! be driven (and tested) from any event loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::pipeline::Session;
use crate::render::CellSize;
use crate::scanner::entries::{Entry, EntryEvent, EntryKind};
use crate::scanner::tree::ContentTree;

/// Selected menu position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    /// The ".." entry.
    Parent,
    Item(usize),
}

/// What the main pane shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum View {
    Empty,
    Image(PathBuf),
    Grid(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Select(Position),
    /// Enter the selected directory; on ".." this is [`Command::Back`].
    Open,
    /// Return to the parent directory.
    Back,
    /// The selected entry was deleted.
    Delete,
}

/// One entered directory.
#[derive(Debug, Clone)]
pub struct Level {
    pub dir: PathBuf,
    pub tree: ContentTree,
    pub items: Vec<Entry>,
    /// Whether the listing of `dir` ran to the end.
    pub complete: bool,
    pub pos: Position,
    /// Generation of the listing feeding `items`.
    listing: Option<u64>,
}

impl Level {
    fn new(dir: PathBuf, tree: ContentTree, pos: Position) -> Self {
        Self {
            dir,
            tree,
            items: Vec::new(),
            complete: false,
            pos,
            listing: None,
        }
    }

    fn selected(&self) -> Option<&Entry> {
        match self.pos {
            Position::Item(i) => self.items.get(i),
            Position::Parent => None,
        }
    }

    /// Position after removing the selected item.
    fn clamp_after_removal(&mut self, removed: usize) {
        self.pos = match self.items.len() {
            0 => Position::Parent,
            len => Position::Item(removed.min(len - 1)),
        };
    }
}

/// Side effects of navigation.
pub trait NavEffects {
    fn show_image(&mut self, path: &Path);
    /// Show the grid of `dir`. `resync` is set when the grid shows a new
    /// directory with images.
    fn show_grid(&mut self, dir: &Path, tree: &ContentTree, resync: bool);
    /// Show neither an image nor a grid.
    fn clear_view(&mut self);
    /// Stop listings in progress before the current directory changes.
    fn halt_listing(&mut self);
    /// Start listing `dir` into the menu. Returns the listing generation.
    fn list_menu(&mut self, dir: &Path, tree: &ContentTree, resume_after: Option<&str>) -> u64;
}

#[derive(Debug, Clone)]
pub struct NavState {
    levels: Vec<Level>,
    view: View,
    /// Last grid directory with images, so re-showing it needs no resync.
    last_grid: Option<PathBuf>,
}

impl NavState {
    /// Start at `root` and list it.
    pub fn start(root: PathBuf, tree: ContentTree, fx: &mut dyn NavEffects) -> Self {
        let mut level = Level::new(root, tree, Position::Item(0));
        level.listing = Some(fx.list_menu(&level.dir, &level.tree, None));
        Self {
            levels: vec![level],
            view: View::Empty,
            last_grid: None,
        }
    }

    pub fn current(&self) -> &Level {
        // Never empty: the root level is never popped
        &self.levels[self.levels.len() - 1]
    }

    fn current_mut(&mut self) -> &mut Level {
        let last = self.levels.len() - 1;
        &mut self.levels[last]
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    pub fn is_top_level(&self) -> bool {
        self.levels.len() == 1
    }

    pub fn view(&self) -> &View {
        &self.view
    }

    /// Apply a menu listing event. Events of other listings are ignored.
    /// Returns whether the menu changed.
    pub fn apply_listing(&mut self, event: EntryEvent) -> bool {
        let level = self.current_mut();
        if level.listing != Some(event.generation()) {
            return false;
        }
        match event {
            EntryEvent::Entry { entry, .. } => level.items.push(entry),
            EntryEvent::Done { .. } => {
                level.complete = true;
                level.listing = None;
            }
            EntryEvent::Failed { .. } => level.listing = None,
        }
        true
    }

    /// Show whatever the current position selects.
    fn show_selection(&mut self, fx: &mut dyn NavEffects) {
        let top_level = self.is_top_level();
        let level = self.current_mut();
        if level.pos == Position::Parent && top_level && !level.items.is_empty() {
            // ".." is not selectable at the top level
            level.pos = Position::Item(0);
        }

        let Some(entry) = level.selected().cloned() else {
            fx.clear_view();
            self.view = View::Empty;
            return;
        };
        let path = level.dir.join(&entry.name);
        match entry.kind {
            EntryKind::Image => {
                fx.show_image(&path);
                self.view = View::Image(path);
            }
            EntryKind::Directory => {
                let tree = level.tree.get(&entry.name).cloned().unwrap_or_default();
                let resync = tree.has_images() && self.last_grid.as_ref() != Some(&path);
                if tree.has_images() {
                    self.last_grid = Some(path.clone());
                }
                fx.show_grid(&path, &tree, resync);
                self.view = View::Grid(path);
            }
        }
    }
}

/// Apply `command` to `state`.
pub fn transition(mut state: NavState, command: Command, fx: &mut dyn NavEffects) -> NavState {
    match command {
        Command::Select(pos) => {
            let level = state.current();
            let valid = match pos {
                Position::Parent => true,
                Position::Item(i) => i < level.items.len(),
            };
            let changed = pos != level.pos || state.view == View::Empty;
            if valid && changed {
                state.current_mut().pos = pos;
                state.show_selection(fx);
            }
        }
        Command::Open => {
            let level = state.current();
            match level.selected() {
                None if !state.is_top_level() => return transition(state, Command::Back, fx),
                Some(entry) if entry.kind == EntryKind::Directory => {
                    let dir = level.dir.join(&entry.name);
                    let tree = level.tree.get(&entry.name).cloned().unwrap_or_default();
                    fx.halt_listing();
                    debug!(?dir, "Entering directory");

                    let mut child = Level::new(dir, tree, Position::Parent);
                    child.listing = Some(fx.list_menu(&child.dir, &child.tree, None));
                    state.levels.push(child);
                    state.show_selection(fx);
                }
                _ => {}
            }
        }
        Command::Back => {
            if state.is_top_level() {
                return state;
            }
            fx.halt_listing();
            let child = state.levels.pop();
            let empty = child.as_ref().is_some_and(|c| c.complete && c.items.is_empty());

            let parent = state.current_mut();
            debug!(dir = ?parent.dir, "Going back");
            if empty {
                if let Position::Item(i) = parent.pos {
                    let removed = parent.items.remove(i);
                    parent.tree.remove(&removed.name);
                    parent.clamp_after_removal(i);
                    debug!(entry = %removed.name, "Removed empty directory entry");
                }
            }
            if !parent.complete {
                let resume_after = parent.items.last().map(|e| e.name.clone());
                parent.listing = Some(fx.list_menu(&parent.dir, &parent.tree, resume_after.as_deref()));
            }
            state.show_selection(fx);
        }
        Command::Delete => {
            let level = state.current_mut();
            if let Position::Item(i) = level.pos {
                if i < level.items.len() {
                    level.items.remove(i);
                    level.clamp_after_removal(i);
                    state.show_selection(fx);
                }
            }
        }
    }
    state
}

/// [`NavEffects`] driving a [`Session`].
pub struct SessionNavigator<'a> {
    session: &'a Session,
    image_size: CellSize,
}

impl<'a> SessionNavigator<'a> {
    pub fn new(session: &'a Session, image_size: CellSize) -> Self {
        Self { session, image_size }
    }
}

impl NavEffects for SessionNavigator<'_> {
    fn show_image(&mut self, path: &Path) {
        self.session.close_grid();
        let animated = image::ImageFormat::from_path(path).is_ok_and(|f| f == image::ImageFormat::Gif);
        if animated {
            self.session.play_animation(path, self.image_size);
        } else {
            self.session.show_image(path, self.image_size);
        }
    }

    fn show_grid(&mut self, dir: &Path, tree: &ContentTree, resync: bool) {
        self.session.hide_image();
        self.session.open_grid(dir, Arc::new(tree.clone()), resync);
    }

    fn clear_view(&mut self) {
        self.session.hide_image();
        self.session.close_grid();
    }

    fn halt_listing(&mut self) {
        self.session.menu().interrupt();
        self.session.grid_entries().interrupt();
    }

    fn list_menu(&mut self, dir: &Path, tree: &ContentTree, resume_after: Option<&str>) -> u64 {
        self.session
            .menu()
            .request(dir, Arc::new(tree.clone()), resume_after.map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Effect {
        Image(PathBuf),
        Grid(PathBuf, bool),
        Clear,
        Halt,
        List(PathBuf, Option<String>),
    }

    #[derive(Default)]
    struct Recorder {
        effects: Vec<Effect>,
        generation: u64,
    }

    impl Recorder {
        fn take(&mut self) -> Vec<Effect> {
            std::mem::take(&mut self.effects)
        }
    }

    impl NavEffects for Recorder {
        fn show_image(&mut self, path: &Path) {
            self.effects.push(Effect::Image(path.to_path_buf()));
        }
        fn show_grid(&mut self, dir: &Path, _tree: &ContentTree, resync: bool) {
            self.effects.push(Effect::Grid(dir.to_path_buf(), resync));
        }
        fn clear_view(&mut self) {
            self.effects.push(Effect::Clear);
        }
        fn halt_listing(&mut self) {
            self.effects.push(Effect::Halt);
        }
        fn list_menu(&mut self, dir: &Path, _tree: &ContentTree, resume_after: Option<&str>) -> u64 {
            self.effects
                .push(Effect::List(dir.to_path_buf(), resume_after.map(str::to_string)));
            self.generation += 1;
            self.generation
        }
    }

    fn image(name: &str) -> Entry {
        Entry {
            name: name.to_string(),
            kind: EntryKind::Image,
        }
    }

    fn dir(name: &str) -> Entry {
        Entry {
            name: name.to_string(),
            kind: EntryKind::Directory,
        }
    }

    /// Feed `entries` to the current listing, completing it if `done`.
    fn list(state: &mut NavState, fx: &Recorder, entries: Vec<Entry>, done: bool) {
        let generation = fx.generation;
        for entry in entries {
            assert!(state.apply_listing(EntryEvent::Entry { generation, entry }));
        }
        if done {
            assert!(state.apply_listing(EntryEvent::Done {
                generation,
                unreadable: 0
            }));
        }
    }

    fn root_tree() -> ContentTree {
        let mut tree = ContentTree::with_images();
        let mut sub = ContentTree::new();
        sub.insert_dir("deep", ContentTree::with_images());
        tree.insert_dir("sub", sub);
        tree.insert_dir("pics", ContentTree::with_images());
        tree
    }

    fn started() -> (NavState, Recorder) {
        let mut fx = Recorder::default();
        let mut state = NavState::start("/r".into(), root_tree(), &mut fx);
        assert_eq!(fx.take(), vec![Effect::List("/r".into(), None)]);
        list(&mut state, &fx, vec![dir("pics"), dir("sub"), image("a.png")], true);
        (state, fx)
    }

    #[test]
    fn test_select_shows_images_and_grids() {
        let (state, mut fx) = started();
        let state = transition(state, Command::Select(Position::Item(2)), &mut fx);
        assert_eq!(state.view(), &View::Image("/r/a.png".into()));

        let state = transition(state, Command::Select(Position::Item(0)), &mut fx);
        assert_eq!(state.view(), &View::Grid("/r/pics".into()));
        // Re-showing the same grid needs no resync; a grid without images never does
        let state = transition(state, Command::Select(Position::Item(1)), &mut fx);
        let _state = transition(state, Command::Select(Position::Item(0)), &mut fx);
        assert_eq!(
            fx.take(),
            vec![
                Effect::Image("/r/a.png".into()),
                Effect::Grid("/r/pics".into(), true),
                Effect::Grid("/r/sub".into(), false),
                Effect::Grid("/r/pics".into(), false),
            ]
        );
    }

    #[test]
    fn test_parent_is_not_selectable_at_top_level() {
        let (state, mut fx) = started();
        let state = transition(state, Command::Select(Position::Parent), &mut fx);
        assert_eq!(state.current().pos, Position::Item(0));
        let state = transition(state, Command::Back, &mut fx);
        assert!(state.is_top_level());
    }

    #[test]
    fn test_open_and_back() {
        let (state, mut fx) = started();
        let state = transition(state, Command::Select(Position::Item(1)), &mut fx);
        fx.take();

        let mut state = transition(state, Command::Open, &mut fx);
        assert_eq!(state.depth(), 2);
        assert_eq!(state.current().dir, PathBuf::from("/r/sub"));
        assert_eq!(
            fx.take(),
            vec![Effect::Halt, Effect::List("/r/sub".into(), None), Effect::Clear]
        );
        list(&mut state, &fx, vec![dir("deep")], true);

        // Open on ".." goes back
        let state = transition(state, Command::Open, &mut fx);
        assert_eq!(state.depth(), 1);
        assert_eq!(state.current().pos, Position::Item(1));
        assert_eq!(state.view(), &View::Grid("/r/sub".into()));
    }

    #[test]
    fn test_back_resumes_incomplete_listing() {
        let mut fx = Recorder::default();
        let mut state = NavState::start("/r".into(), root_tree(), &mut fx);
        list(&mut state, &fx, vec![dir("pics")], false);
        let state = transition(state, Command::Select(Position::Item(0)), &mut fx);
        let mut state = transition(state, Command::Open, &mut fx);
        list(&mut state, &fx, vec![image("x.png")], true);
        fx.take();

        let mut state = transition(state, Command::Back, &mut fx);
        assert_eq!(
            fx.take(),
            vec![
                Effect::Halt,
                Effect::List("/r".into(), Some("pics".into())),
                Effect::Grid("/r/pics".into(), false),
            ]
        );
        list(&mut state, &fx, vec![image("z.png")], true);
        assert_eq!(state.current().items.len(), 2);
        assert!(state.current().complete);
    }

    #[test]
    fn test_back_from_emptied_directory_removes_it() {
        let (state, mut fx) = started();
        let state = transition(state, Command::Select(Position::Item(0)), &mut fx);
        let mut state = transition(state, Command::Open, &mut fx);
        list(&mut state, &fx, vec![image("only.png")], true);
        let state = transition(state, Command::Select(Position::Item(0)), &mut fx);
        let state = transition(state, Command::Delete, &mut fx);
        assert_eq!(state.current().pos, Position::Parent);

        let state = transition(state, Command::Back, &mut fx);
        let level = state.current();
        assert_eq!(level.items, vec![dir("sub"), image("a.png")]);
        assert!(!level.tree.contains("pics"));
        assert_eq!(level.pos, Position::Item(0));
        assert_eq!(state.view(), &View::Grid("/r/sub".into()));
    }

    #[test]
    fn test_delete_selects_next_item() {
        let (state, mut fx) = started();
        let state = transition(state, Command::Select(Position::Item(1)), &mut fx);
        let state = transition(state, Command::Delete, &mut fx);
        assert_eq!(state.current().pos, Position::Item(1));
        assert_eq!(state.view(), &View::Image("/r/a.png".into()));

        let state = transition(state, Command::Delete, &mut fx);
        assert_eq!(state.current().pos, Position::Item(0));
        assert_eq!(state.view(), &View::Grid("/r/pics".into()));
    }

    #[test]
    fn test_stale_listing_events_are_ignored() {
        let (mut state, fx) = started();
        let stale = fx.generation - 1;
        assert!(!state.apply_listing(EntryEvent::Entry {
            generation: stale,
            entry: image("late.png")
        }));
        assert_eq!(state.current().items.len(), 3);
    }
}
