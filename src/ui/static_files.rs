//! Embedded static assets for the dashboard.

pub const CSS: &str = r#"
body { font-family: -apple-system, "Segoe UI", sans-serif; margin: 0; color: #1c2330; background: #f5f6f8; }
nav { background: #1c2330; color: #fff; padding: 0.75rem 1.5rem; }
nav a { color: #9fb3d1; margin-left: 1rem; text-decoration: none; }
nav a:hover { color: #fff; }
h1 { margin: 1.5rem; }
.cards { display: flex; gap: 1rem; margin: 0 1.5rem; flex-wrap: wrap; }
.card { background: #fff; border-radius: 6px; padding: 1rem 1.5rem; box-shadow: 0 1px 3px rgba(0,0,0,0.1); display: flex; flex-direction: column; }
.card .value { font-size: 1.8rem; font-weight: 600; }
.card .label { color: #68758a; font-size: 0.85rem; }
table { border-collapse: collapse; margin: 1.5rem; background: #fff; box-shadow: 0 1px 3px rgba(0,0,0,0.1); }
th, td { padding: 0.5rem 0.9rem; text-align: left; border-bottom: 1px solid #e4e7ec; font-size: 0.9rem; }
th { background: #eef1f5; }
p.ok { color: #1a7f37; margin: 0 1.5rem; font-weight: 600; }
p.bad { color: #b42318; margin: 0 1.5rem; font-weight: 600; }
p { margin: 0.5rem 1.5rem; }
"#;
