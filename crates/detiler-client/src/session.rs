//! Viewport-driven query state for map dashboards.
//!
//! A dashboard owns one [`ViewportSession`]. It records the kit the user
//! selected and the visible map area, and turns them into a tile query only
//! when that query differs from the last one issued.

use detiler_core::geometry::WEB_MERCATOR_MAX_LAT;
use detiler_core::{BoundingBox, KitMetadata, KitName, TileQuery};

/// Tile zoom queried relative to the map's integer zoom level.
pub const ZOOM_OFFSET: u32 = 3;

const MIN_QUERY_LONGITUDE: f64 = -179.99999;
const MAX_QUERY_LONGITUDE: f64 = 180.0;

#[derive(Debug, Clone)]
pub struct ViewportSession {
    kits: Vec<KitMetadata>,
    selected_kit: Option<KitName>,
    zoom: u32,
    bounds: Option<BoundingBox>,
    min_state: Option<i64>,
    max_state: Option<i64>,
    last_query: Option<TileQuery>,
    force_render: bool,
}

impl Default for ViewportSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ViewportSession {
    pub fn new() -> Self {
        Self {
            kits: Vec::new(),
            selected_kit: None,
            // Dashboards open the map at this zoom, so the first viewport at
            // the same level is not reported as a zoom change.
            zoom: ZOOM_OFFSET,
            bounds: None,
            min_state: None,
            max_state: None,
            last_query: None,
            force_render: false,
        }
    }

    /// Replace the known kits, typically after a periodic `get_kits`.
    pub fn set_kits(&mut self, kits: Vec<KitMetadata>) {
        self.kits = kits;
    }

    pub fn kits(&self) -> &[KitMetadata] {
        &self.kits
    }

    pub fn select_kit(&mut self, kit: impl Into<KitName>) {
        self.selected_kit = Some(kit.into());
        self.force_render = true;
    }

    pub fn selected_kit(&self) -> Option<&str> {
        self.selected_kit.as_deref()
    }

    pub fn set_state_range(&mut self, min_state: Option<i64>, max_state: Option<i64>) {
        self.min_state = min_state;
        self.max_state = max_state;
        self.force_render = true;
    }

    /// Record a viewport change. Returns true when the integer zoom level
    /// changed.
    pub fn update_viewport(&mut self, zoom: f64, bounds: BoundingBox) -> bool {
        self.bounds = Some(clamp_bounds(bounds));
        self.force_render = true;

        let next_zoom = zoom.floor().max(0.0) as u32;
        if next_zoom == self.zoom {
            return false;
        }
        self.zoom = next_zoom;
        true
    }

    pub fn zoom(&self) -> u32 {
        self.zoom
    }

    /// The query to issue for the current viewport, or `None` when no kit
    /// or area is set yet or the query equals the previous one.
    pub fn next_query(&mut self) -> Option<TileQuery> {
        let bounds = self.bounds?;
        let kit = self.selected_kit.clone()?;
        let tile_zoom = self.zoom + ZOOM_OFFSET;
        let query = TileQuery {
            min_zoom: tile_zoom,
            max_zoom: tile_zoom,
            min_state: self.min_state,
            max_state: self.max_state,
            kits: vec![kit],
            area: Some(bounds),
            ..Default::default()
        };
        if self.last_query.as_ref() == Some(&query) {
            return None;
        }
        self.last_query = Some(query.clone());
        Some(query)
    }

    pub fn last_query(&self) -> Option<&TileQuery> {
        self.last_query.as_ref()
    }

    /// Whether the next render must happen even if the data looks
    /// unchanged. Reading the flag clears it.
    pub fn take_force_render(&mut self) -> bool {
        std::mem::take(&mut self.force_render)
    }
}

fn clamp_bounds(bounds: BoundingBox) -> BoundingBox {
    let lon = |v: f64| v.clamp(MIN_QUERY_LONGITUDE, MAX_QUERY_LONGITUDE);
    let lat = |v: f64| v.clamp(-WEB_MERCATOR_MAX_LAT, WEB_MERCATOR_MAX_LAT);
    BoundingBox::new(
        lon(bounds.west),
        lat(bounds.south),
        lon(bounds.east),
        lat(bounds.north),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_query_until_kit_and_bounds() {
        let mut session = ViewportSession::new();
        assert!(session.next_query().is_none());

        session.update_viewport(4.2, BoundingBox::new(0.0, 0.0, 10.0, 10.0));
        assert!(session.next_query().is_none());

        session.select_kit("osm");
        let query = session.next_query().unwrap();
        assert_eq!(query.kits, vec!["osm"]);
        assert_eq!((query.min_zoom, query.max_zoom), (7, 7));
        assert_eq!(query.area, Some(BoundingBox::new(0.0, 0.0, 10.0, 10.0)));
    }

    #[test]
    fn identical_query_is_not_repeated() {
        let mut session = ViewportSession::new();
        session.select_kit("osm");
        session.update_viewport(3.0, BoundingBox::new(0.0, 0.0, 10.0, 10.0));
        assert!(session.next_query().is_some());
        assert!(session.next_query().is_none());

        // sub-level zoom change, same bounds
        assert!(!session.update_viewport(3.7, BoundingBox::new(0.0, 0.0, 10.0, 10.0)));
        assert!(session.next_query().is_none());

        session.set_state_range(Some(1), None);
        assert_eq!(session.next_query().unwrap().min_state, Some(1));

        session.select_kit("other");
        assert_eq!(session.next_query().unwrap().kits, vec!["other"]);
    }

    #[test]
    fn zoom_change_is_reported() {
        let mut session = ViewportSession::new();
        assert_eq!(session.zoom(), ZOOM_OFFSET);
        assert!(!session.update_viewport(f64::from(ZOOM_OFFSET), BoundingBox::new(0.0, 0.0, 1.0, 1.0)));
        assert!(session.update_viewport(5.9, BoundingBox::new(0.0, 0.0, 1.0, 1.0)));
        assert_eq!(session.zoom(), 5);
        assert!(!session.update_viewport(5.1, BoundingBox::new(0.0, 0.0, 1.0, 1.0)));
    }

    #[test]
    fn bounds_are_clamped_to_the_grid() {
        let mut session = ViewportSession::new();
        session.select_kit("osm");
        session.update_viewport(0.0, BoundingBox::new(-200.0, -89.0, 200.0, 89.0));
        let area = session.next_query().unwrap().area.unwrap();
        assert_eq!(area.west, MIN_QUERY_LONGITUDE);
        assert_eq!(area.east, MAX_QUERY_LONGITUDE);
        assert_eq!(area.south, -WEB_MERCATOR_MAX_LAT);
        assert_eq!(area.north, WEB_MERCATOR_MAX_LAT);
        assert!(area.validate_web_mercator().is_ok());
    }

    #[test]
    fn force_render_flag_clears_on_read() {
        let mut session = ViewportSession::new();
        assert!(!session.take_force_render());
        session.select_kit("osm");
        assert!(session.take_force_render());
        assert!(!session.take_force_render());
    }
}
