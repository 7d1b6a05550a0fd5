//! Content pages and the FAQ.
//!
//! Pages hold markdown in German and English that is rendered to HTML when read. FAQ entries
//! are grouped into optional categories. Only published pages, categories and entries are
//! visible through the API, and pages are never deleted.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use pulldown_cmark::{html, Event, Options, Parser};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{validation, AppError, AppResult, OptionExt};
use crate::users::User;

pub const MAX_PAGE_NAME_LEN: usize = 128;
pub const MAX_PAGE_SLUG_LEN: usize = 128;
pub const MAX_FAQ_TEXT_LEN: usize = 255;

/// Pages every installation starts with, unpublished and empty.
pub const DEFAULT_PAGES: &[(&str, &str)] =
    &[("terms-of-use", "Terms of use"), ("privacy-policy", "Privacy policy"), ("accessibility", "Accessibility")];

// Taken by `GET /cms/slugs`
const RESERVED_SLUGS: &[&str] = &["slugs"];

const PAGE_COLUMNS: &str =
    "id, name, slug, published, text_de, text_en, created_by, last_modified_by, creation_date, last_modified_date";
const CATEGORY_COLUMNS: &str =
    "id, name, slug, sort_order, published, created_by, last_modified_by, creation_date, last_modified_date";
const FAQ_COLUMNS: &str = "id, question, slug, answer, category_id, sort_order, published, created_by, \
     last_modified_by, creation_date, last_modified_date";

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Page {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub published: bool,
    pub text_de: Option<String>,
    pub text_en: Option<String>,
    pub created_by: Option<Uuid>,
    pub last_modified_by: Option<Uuid>,
    pub creation_date: DateTime<Utc>,
    pub last_modified_date: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct PageView {
    pub name: String,
    pub slug: String,
    pub published: bool,
    pub text_de_html: String,
    pub text_en_html: String,
    pub created_by: Option<Uuid>,
    pub last_modified_by: Option<Uuid>,
    pub creation_date: DateTime<Utc>,
    pub last_modified_date: DateTime<Utc>,
}

impl From<Page> for PageView {
    fn from(page: Page) -> Self {
        PageView {
            text_de_html: render_markdown(page.text_de.as_deref().unwrap_or_default()),
            text_en_html: render_markdown(page.text_en.as_deref().unwrap_or_default()),
            name: page.name,
            slug: page.slug,
            published: page.published,
            created_by: page.created_by,
            last_modified_by: page.last_modified_by,
            creation_date: page.creation_date,
            last_modified_date: page.last_modified_date,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PageInput {
    pub name: String,
    #[serde(default)]
    pub published: bool,
    pub text_de: Option<String>,
    pub text_en: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Category {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub sort_order: i64,
    pub published: bool,
    pub created_by: Option<Uuid>,
    pub last_modified_by: Option<Uuid>,
    pub creation_date: DateTime<Utc>,
    pub last_modified_date: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Faq {
    pub id: Uuid,
    pub question: String,
    pub slug: String,
    pub answer: Option<String>,
    pub category_id: Option<Uuid>,
    pub sort_order: i64,
    pub published: bool,
    pub created_by: Option<Uuid>,
    pub last_modified_by: Option<Uuid>,
    pub creation_date: DateTime<Utc>,
    pub last_modified_date: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct CategoryMinimal {
    pub pk: Uuid,
    pub name: String,
    pub slug: String,
}

#[derive(Debug, Serialize)]
pub struct FaqMinimal {
    pub pk: Uuid,
    pub question: String,
    pub slug: String,
    pub answer: Option<String>,
    pub order: i64,
}

#[derive(Debug, Serialize)]
pub struct CategoryView {
    pub pk: Uuid,
    pub name: String,
    pub slug: String,
    pub faq: Vec<FaqMinimal>,
    pub order: i64,
}

#[derive(Debug, Serialize)]
pub struct FaqView {
    pub pk: Uuid,
    pub question: String,
    pub slug: String,
    pub answer: Option<String>,
    pub category: Option<CategoryMinimal>,
    pub order: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewCategory {
    pub name: String,
    pub slug: Option<String>,
    #[serde(default)]
    pub order: i64,
    #[serde(default)]
    pub published: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewFaq {
    pub question: String,
    pub slug: Option<String>,
    pub answer: Option<String>,
    pub category: Option<Uuid>,
    #[serde(default)]
    pub order: i64,
    #[serde(default)]
    pub published: bool,
}

impl Faq {
    fn minimal(self) -> FaqMinimal {
        FaqMinimal { pk: self.id, question: self.question, slug: self.slug, answer: self.answer, order: self.sort_order }
    }
}

impl Category {
    fn minimal(&self) -> CategoryMinimal {
        CategoryMinimal { pk: self.id, name: self.name.clone(), slug: self.slug.clone() }
    }
}

/// Renders markdown to HTML. Raw HTML in the source is escaped and the remaining line breaks
/// become `<br/>` unless preceded by a backslash.
pub fn render_markdown(text: &str) -> String {
    let parser = Parser::new_ext(text, Options::ENABLE_TABLES | Options::ENABLE_STRIKETHROUGH).map(|event| match event {
        Event::Html(raw) | Event::InlineHtml(raw) => Event::Text(raw),
        other => other,
    });
    let mut rendered = String::with_capacity(text.len() * 3 / 2);
    html::push_html(&mut rendered, parser);

    let mut out = String::with_capacity(rendered.len());
    let mut previous = None;
    for c in rendered.chars() {
        if c == '\n' && previous != Some('\\') {
            out.push_str("<br/>");
        } else {
            out.push(c);
        }
        previous = Some(c);
    }
    out
}

/// Lowercase ASCII slug: letters, digits, underscores and single hyphens.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut pending_hyphen = false;
    for c in text.chars() {
        let c = fold_latin(c);
        if c.is_ascii_alphanumeric() || c == '_' {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.push(c.to_ascii_lowercase());
        } else if c == '-' || c.is_whitespace() {
            pending_hyphen = true;
        }
    }
    slug.trim_matches(|c: char| c == '-' || c == '_').to_string()
}

fn fold_latin(c: char) -> char {
    match c {
        'à'..='å' | 'À'..='Å' => 'a',
        'ç' | 'Ç' => 'c',
        'è'..='ë' | 'È'..='Ë' => 'e',
        'ì'..='ï' | 'Ì'..='Ï' => 'i',
        'ñ' | 'Ñ' => 'n',
        'ò'..='ö' | 'Ò'..='Ö' => 'o',
        'ù'..='ü' | 'Ù'..='Ü' => 'u',
        'ý' | 'ÿ' | 'Ý' => 'y',
        other => other,
    }
}

fn resolve_slug(explicit: Option<&str>, source: &str, max_len: usize) -> AppResult<String> {
    let slug = match explicit.map(str::trim).filter(|s| !s.is_empty()) {
        Some(given) => {
            if slugify(given) != given {
                return Err(AppError::validation("slug", "Enter a valid slug of lowercase letters, numbers, underscores or hyphens."));
            }
            given.to_string()
        }
        None => slugify(source),
    };
    if slug.is_empty() {
        return Err(AppError::validation("slug", "A slug could not be derived; provide one."));
    }
    if slug.len() > max_len {
        return Err(AppError::validation("slug", format!("Ensure this field has no more than {} characters.", max_len)));
    }
    Ok(slug)
}

pub async fn published_slugs(db: &SqlitePool) -> AppResult<Vec<String>> {
    Ok(sqlx::query_scalar("SELECT slug FROM cms_content WHERE published = 1 ORDER BY slug").fetch_all(db).await?)
}

async fn find_page(db: &SqlitePool, slug: &str) -> AppResult<Option<Page>> {
    let sql = format!("SELECT {} FROM cms_content WHERE slug = ?", PAGE_COLUMNS);
    Ok(sqlx::query_as::<_, Page>(&sql).bind(slug).fetch_optional(db).await?)
}

pub async fn published_page(db: &SqlitePool, slug: &str) -> AppResult<PageView> {
    let page = find_page(db, slug).await?.filter(|p| p.published).ok_or_not_found("Content page")?;
    Ok(page.into())
}

/// Creates or replaces the page at `slug`.
pub async fn upsert_page(db: &SqlitePool, slug: &str, input: PageInput, user: &User) -> AppResult<PageView> {
    let slug = resolve_slug(Some(slug), "", MAX_PAGE_SLUG_LEN)?;
    if RESERVED_SLUGS.contains(&slug.as_str()) {
        return Err(AppError::validation("slug", format!("The slug '{}' is reserved.", slug)));
    }
    let name = validation::validate_name(&input.name, "name", MAX_PAGE_NAME_LEN)?;
    let now = Utc::now();
    sqlx::query(
        r#"INSERT INTO cms_content (id, name, slug, published, text_de, text_en, created_by, last_modified_by,
                                   creation_date, last_modified_date)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
           ON CONFLICT(slug) DO UPDATE SET
             name = excluded.name,
             published = excluded.published,
             text_de = excluded.text_de,
             text_en = excluded.text_en,
             last_modified_by = excluded.last_modified_by,
             last_modified_date = excluded.last_modified_date"#,
    )
    .bind(Uuid::new_v4())
    .bind(&name)
    .bind(&slug)
    .bind(input.published)
    .bind(&input.text_de)
    .bind(&input.text_en)
    .bind(user.id)
    .bind(user.id)
    .bind(now)
    .bind(now)
    .execute(db)
    .await?;
    Ok(find_page(db, &slug).await?.ok_or_not_found("Content page")?.into())
}

async fn find_category(db: &SqlitePool, id: Uuid) -> AppResult<Option<Category>> {
    let sql = format!("SELECT {} FROM faq_categories WHERE id = ?", CATEGORY_COLUMNS);
    Ok(sqlx::query_as::<_, Category>(&sql).bind(id).fetch_optional(db).await?)
}

async fn published_categories(db: &SqlitePool) -> AppResult<Vec<Category>> {
    let sql = format!("SELECT {} FROM faq_categories WHERE published = 1 ORDER BY sort_order, name", CATEGORY_COLUMNS);
    Ok(sqlx::query_as::<_, Category>(&sql).fetch_all(db).await?)
}

async fn category_view(db: &SqlitePool, category: Category) -> AppResult<CategoryView> {
    let sql = format!(
        "SELECT {} FROM faqs WHERE category_id = ? AND published = 1 ORDER BY sort_order, question",
        FAQ_COLUMNS
    );
    let faqs = sqlx::query_as::<_, Faq>(&sql).bind(category.id).fetch_all(db).await?;
    Ok(CategoryView {
        pk: category.id,
        name: category.name,
        slug: category.slug,
        faq: faqs.into_iter().map(Faq::minimal).collect(),
        order: category.sort_order,
    })
}

/// Published categories by order, each with its published entries.
pub async fn list_categories(db: &SqlitePool) -> AppResult<Vec<CategoryView>> {
    let mut views = Vec::new();
    for category in published_categories(db).await? {
        views.push(category_view(db, category).await?);
    }
    Ok(views)
}

pub async fn get_category(db: &SqlitePool, id: Uuid) -> AppResult<CategoryView> {
    let category = find_category(db, id).await?.filter(|c| c.published).ok_or_not_found("FAQ category")?;
    category_view(db, category).await
}

fn faq_view(faq: Faq, categories: &HashMap<Uuid, Category>) -> FaqView {
    FaqView {
        category: faq.category_id.and_then(|id| categories.get(&id)).map(Category::minimal),
        pk: faq.id,
        question: faq.question,
        slug: faq.slug,
        answer: faq.answer,
        order: faq.sort_order,
    }
}

/// Published entries without a category or in a published one, ordered by category, then entry.
pub async fn list_faqs(db: &SqlitePool) -> AppResult<Vec<FaqView>> {
    let categories: HashMap<Uuid, Category> =
        published_categories(db).await?.into_iter().map(|c| (c.id, c)).collect();
    let sql = r#"SELECT f.id, f.question, f.slug, f.answer, f.category_id, f.sort_order, f.published, f.created_by,
                        f.last_modified_by, f.creation_date, f.last_modified_date
                 FROM faqs f LEFT JOIN faq_categories c ON c.id = f.category_id
                 WHERE f.published = 1 AND (f.category_id IS NULL OR c.published = 1)
                 ORDER BY c.sort_order IS NULL, c.sort_order, f.sort_order, f.question"#;
    let faqs = sqlx::query_as::<_, Faq>(sql).fetch_all(db).await?;
    Ok(faqs.into_iter().map(|f| faq_view(f, &categories)).collect())
}

pub async fn get_faq(db: &SqlitePool, id: Uuid) -> AppResult<FaqView> {
    let categories: HashMap<Uuid, Category> =
        published_categories(db).await?.into_iter().map(|c| (c.id, c)).collect();
    let sql = format!("SELECT {} FROM faqs WHERE id = ? AND published = 1", FAQ_COLUMNS);
    let faq = sqlx::query_as::<_, Faq>(&sql)
        .bind(id)
        .fetch_optional(db)
        .await?
        .filter(|f| f.category_id.map_or(true, |c| categories.contains_key(&c)))
        .ok_or_not_found("FAQ")?;
    Ok(faq_view(faq, &categories))
}

pub async fn create_category(db: &SqlitePool, input: NewCategory, user: &User) -> AppResult<CategoryView> {
    let name = validation::validate_name(&input.name, "name", MAX_FAQ_TEXT_LEN)?;
    let slug = resolve_slug(input.slug.as_deref(), &name, MAX_FAQ_TEXT_LEN)?;
    if input.order < 0 {
        return Err(AppError::validation("order", "Ensure this value is greater than or equal to 0."));
    }
    let id = Uuid::new_v4();
    let now = Utc::now();
    sqlx::query(
        r#"INSERT INTO faq_categories (id, name, slug, sort_order, published, created_by, last_modified_by,
                                      creation_date, last_modified_date)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(id)
    .bind(&name)
    .bind(&slug)
    .bind(input.order)
    .bind(input.published)
    .bind(user.id)
    .bind(user.id)
    .bind(now)
    .bind(now)
    .execute(db)
    .await?;
    tracing::info!(user = %user.id, category = %id, "Created FAQ category {}", slug);
    let category = find_category(db, id).await?.ok_or_not_found("FAQ category")?;
    category_view(db, category).await
}

pub async fn create_faq(db: &SqlitePool, input: NewFaq, user: &User) -> AppResult<FaqView> {
    let question = validation::validate_name(&input.question, "question", MAX_FAQ_TEXT_LEN)?;
    let slug = resolve_slug(input.slug.as_deref(), &question, MAX_FAQ_TEXT_LEN)?;
    if input.order < 0 {
        return Err(AppError::validation("order", "Ensure this value is greater than or equal to 0."));
    }
    let mut categories = HashMap::new();
    if let Some(category_id) = input.category {
        let category = find_category(db, category_id)
            .await?
            .ok_or_else(|| AppError::validation("category", "Invalid pk - object does not exist."))?;
        categories.insert(category.id, category);
    }
    let id = Uuid::new_v4();
    let now = Utc::now();
    sqlx::query(
        r#"INSERT INTO faqs (id, question, slug, answer, category_id, sort_order, published, created_by,
                            last_modified_by, creation_date, last_modified_date)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(id)
    .bind(&question)
    .bind(&slug)
    .bind(&input.answer)
    .bind(input.category)
    .bind(input.order)
    .bind(input.published)
    .bind(user.id)
    .bind(user.id)
    .bind(now)
    .bind(now)
    .execute(db)
    .await?;
    tracing::info!(user = %user.id, faq = %id, "Created FAQ {}", slug);
    let sql = format!("SELECT {} FROM faqs WHERE id = ?", FAQ_COLUMNS);
    let faq = sqlx::query_as::<_, Faq>(&sql).bind(id).fetch_one(db).await?;
    Ok(faq_view(faq, &categories))
}
