//! Route registration. The router matches each pattern exactly - there is
//! no ancestor cascade from a shorter prefix down to its children - so
//! `auth::restore` is pushed onto every pattern's own middleware chain
//! ahead of its handler, rather than registered once at the root.

pub mod auth;
pub mod data;
pub mod do_ops;
pub mod feather;
pub mod module;
pub mod settings;
pub mod sse;
pub mod workbook;

use crate::http::{App, Middleware};
use crate::state::AppState;

fn secured(app: &mut App<AppState>, pattern: &str, handler: impl Middleware<AppState> + 'static) {
    app.at(pattern, auth::restore);
    app.at(pattern, handler);
}

pub fn configure(app: &mut App<AppState>) {
    secured(app, "/data/:name", data::collection);
    secured(app, "/data/:name/:id", data::member);

    secured(app, "/feather/:name", feather::by_name);

    secured(app, "/module", module::list);
    secured(app, "/modules", module::list);

    secured(app, "/settings/:name", settings::by_name);
    secured(app, "/settings-definition", settings::definition);

    secured(app, "/workbook", workbook::list);
    secured(app, "/workbooks", workbook::list);
    secured(app, "/workbook/:name", workbook::by_name);
    secured(app, "/workbooks/:name", workbook::by_name);

    secured(app, "/do/subscribe", do_ops::subscribe);
    secured(app, "/do/unsubscribe", do_ops::unsubscribe);
    secured(app, "/do/lock", do_ops::lock);
    secured(app, "/do/unlock", do_ops::unlock);

    secured(app, "/sse", sse::bootstrap);
    secured(app, "/sse/:sessionId", sse::reconnect);
}
