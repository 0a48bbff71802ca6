use crate::store::Store;
use crate::view_mode::{default_view_mode, ViewMode};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DriveView {
    #[default]
    Private,
    Shared,
}

impl DriveView {
    pub fn root_label(&self) -> &'static str {
        match self {
            DriveView::Private => "Private",
            DriveView::Shared => "Shared",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BreadcrumbItem {
    pub id: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelectedFile {
    pub id: String,
    pub name: String,
    pub file_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveState {
    pub view: DriveView,
    pub current_folder_id: Option<String>,
    pub breadcrumbs: Vec<BreadcrumbItem>,
    pub selected_file: Option<SelectedFile>,
    pub view_mode: ViewMode,
    /// Set when the state was restored from an addressable location, so the
    /// location is not written back.
    pub from_location: bool,
}

impl DriveState {
    pub fn selected_file_id(&self) -> Option<&str> {
        self.selected_file.as_ref().map(|f| f.id.as_str())
    }
}

impl Default for DriveState {
    fn default() -> Self {
        Self {
            view: DriveView::Private,
            current_folder_id: None,
            breadcrumbs: vec![root_crumb(DriveView::Private, None)],
            selected_file: None,
            view_mode: ViewMode::Edit,
            from_location: false,
        }
    }
}

fn root_crumb(view: DriveView, id: Option<&str>) -> BreadcrumbItem {
    BreadcrumbItem {
        id: id.map(str::to_string),
        name: view.root_label().to_string(),
    }
}

fn clear_selection(s: &mut DriveState) {
    s.selected_file = None;
    s.view_mode = ViewMode::Edit;
    s.from_location = false;
}

#[derive(Debug, Default)]
pub struct DriveStore {
    state: Store<DriveState>,
}

impl DriveStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> DriveState {
        self.state.snapshot()
    }

    pub fn read<R>(&self, f: impl FnOnce(&DriveState) -> R) -> R {
        self.state.read(f)
    }

    pub fn subscribe(&self) -> watch::Receiver<DriveState> {
        self.state.subscribe()
    }

    pub fn selected_file_id(&self) -> Option<String> {
        self.read(|s| s.selected_file_id().map(str::to_string))
    }

    pub fn set_view(&self, view: DriveView) {
        self.state.mutate(|s| {
            s.view = view;
            s.current_folder_id = None;
            s.breadcrumbs = vec![root_crumb(view, None)];
            clear_selection(s);
            true
        });
    }

    pub fn navigate_to_folder(&self, folder_id: &str, folder_name: &str) {
        self.state.mutate(|s| {
            s.current_folder_id = Some(folder_id.to_string());
            s.breadcrumbs.push(BreadcrumbItem {
                id: Some(folder_id.to_string()),
                name: folder_name.to_string(),
            });
            clear_selection(s);
            true
        });
    }

    /// Returns false for an index past the end of the trail.
    pub fn navigate_to_breadcrumb(&self, index: usize) -> bool {
        self.state.mutate(|s| {
            let Some(crumb) = s.breadcrumbs.get(index) else {
                return false;
            };
            s.current_folder_id = crumb.id.clone();
            s.breadcrumbs.truncate(index + 1);
            clear_selection(s);
            true
        })
    }

    pub fn navigate_to_root(&self, home_folder_id: Option<&str>) {
        self.state.mutate(|s| {
            s.view = DriveView::Private;
            s.current_folder_id = home_folder_id.map(str::to_string);
            s.breadcrumbs = vec![root_crumb(DriveView::Private, home_folder_id)];
            clear_selection(s);
            true
        });
    }

    pub fn select_file(&self, file_id: &str, file_name: &str, file_type: Option<&str>) {
        self.state.mutate(|s| {
            s.view_mode = default_view_mode(file_name, file_type);
            s.selected_file = Some(SelectedFile {
                id: file_id.to_string(),
                name: file_name.to_string(),
                file_type: file_type.map(str::to_string),
            });
            s.from_location = false;
            true
        });
    }

    pub fn clear_selected_file(&self) {
        self.state.mutate(|s| {
            clear_selection(s);
            true
        });
    }

    /// Clears the selection only if `file_id` is the selected file.
    pub fn clear_if_selected(&self, file_id: &str) -> bool {
        self.state.mutate(|s| {
            if s.selected_file_id() != Some(file_id) {
                return false;
            }
            clear_selection(s);
            true
        })
    }

    pub fn set_view_mode(&self, mode: ViewMode) {
        self.state.mutate(|s| {
            if s.view_mode == mode {
                return false;
            }
            s.view_mode = mode;
            true
        });
    }

    /// Restores folder and selection from an addressable location without
    /// marking it for write-back.
    pub fn restore_location(
        &self,
        view: DriveView,
        folder_id: Option<&str>,
        file: Option<SelectedFile>,
    ) {
        self.state.mutate(|s| {
            s.view = view;
            s.current_folder_id = folder_id.map(str::to_string);
            s.breadcrumbs = vec![root_crumb(view, None)];
            s.view_mode = file
                .as_ref()
                .map(|f| default_view_mode(&f.name, f.file_type.as_deref()))
                .unwrap_or_default();
            s.selected_file = file;
            s.from_location = true;
            true
        });
    }

    pub fn reset(&self) {
        self.state.replace(DriveState::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selecting_a_file_derives_its_view_mode() {
        let drive = DriveStore::new();
        drive.select_file("f1", "tasks.csv", None);
        let state = drive.snapshot();
        assert_eq!(state.selected_file_id(), Some("f1"));
        assert_eq!(state.view_mode, ViewMode::Table);

        drive.set_view_mode(ViewMode::Kanban);
        assert_eq!(drive.snapshot().view_mode, ViewMode::Kanban);

        drive.clear_selected_file();
        let state = drive.snapshot();
        assert_eq!(state.selected_file, None);
        assert_eq!(state.view_mode, ViewMode::Edit);
    }

    #[test]
    fn breadcrumbs_push_and_truncate() {
        let drive = DriveStore::new();
        drive.navigate_to_folder("a", "Alpha");
        drive.navigate_to_folder("b", "Beta");
        drive.select_file("f1", "x.md", None);
        assert_eq!(drive.snapshot().breadcrumbs.len(), 3);

        assert!(drive.navigate_to_breadcrumb(1));
        let state = drive.snapshot();
        assert_eq!(state.current_folder_id.as_deref(), Some("a"));
        assert_eq!(state.breadcrumbs.len(), 2);
        assert_eq!(state.selected_file, None);

        assert!(!drive.navigate_to_breadcrumb(5));
        assert_eq!(drive.snapshot().breadcrumbs.len(), 2);

        assert!(drive.navigate_to_breadcrumb(0));
        assert_eq!(drive.snapshot().current_folder_id, None);
    }

    #[test]
    fn root_and_view_switches_reset_the_trail() {
        let drive = DriveStore::new();
        drive.navigate_to_folder("a", "Alpha");
        drive.set_view(DriveView::Shared);
        let state = drive.snapshot();
        assert_eq!(state.breadcrumbs, vec![BreadcrumbItem { id: None, name: "Shared".to_string() }]);

        drive.navigate_to_root(Some("home"));
        let state = drive.snapshot();
        assert_eq!(state.view, DriveView::Private);
        assert_eq!(state.current_folder_id.as_deref(), Some("home"));
        assert_eq!(state.breadcrumbs[0].id.as_deref(), Some("home"));
    }

    #[test]
    fn clear_if_selected_only_matches_the_selected_id() {
        let drive = DriveStore::new();
        drive.select_file("f1", "notes.md", None);
        assert!(!drive.clear_if_selected("f2"));
        assert_eq!(drive.selected_file_id().as_deref(), Some("f1"));
        assert!(drive.clear_if_selected("f1"));
        assert_eq!(drive.selected_file_id(), None);
    }

    #[test]
    fn restore_location_flags_the_state() {
        let drive = DriveStore::new();
        drive.restore_location(
            DriveView::Shared,
            Some("folder-1"),
            Some(SelectedFile {
                id: "f1".to_string(),
                name: "index.html".to_string(),
                file_type: None,
            }),
        );
        let state = drive.snapshot();
        assert!(state.from_location);
        assert_eq!(state.view_mode, ViewMode::HtmlView);
        drive.select_file("f2", "a.txt", None);
        assert!(!drive.snapshot().from_location);
    }
}
