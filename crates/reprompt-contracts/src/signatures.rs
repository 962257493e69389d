use serde::{Deserialize, Serialize};

pub const REASONING_FIELD: &str = "reasoning";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Image,
}

impl FieldKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Text => "str",
            Self::Image => "Image",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub description: String,
}

impl FieldSpec {
    pub fn text(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: FieldKind::Text,
            description: description.to_string(),
        }
    }

    pub fn image(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: FieldKind::Image,
            description: description.to_string(),
        }
    }
}

/// Declarative input/output contract of one prompt template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub name: String,
    pub instructions: String,
    pub inputs: Vec<FieldSpec>,
    pub outputs: Vec<FieldSpec>,
}

impl Signature {
    pub fn new(name: &str, instructions: &str) -> Self {
        Self {
            name: name.to_string(),
            instructions: instructions.to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn input(mut self, field: FieldSpec) -> Self {
        self.inputs.push(field);
        self
    }

    pub fn output(mut self, field: FieldSpec) -> Self {
        self.outputs.push(field);
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.inputs
            .iter()
            .chain(self.outputs.iter())
            .find(|field| field.name == name)
    }

    pub fn input_names(&self) -> Vec<&str> {
        self.inputs.iter().map(|field| field.name.as_str()).collect()
    }

    pub fn output_names(&self) -> Vec<&str> {
        self.outputs.iter().map(|field| field.name.as_str()).collect()
    }

    /// Copy with a leading `reasoning` output, used by chain-of-thought predictors.
    pub fn with_reasoning(&self) -> Self {
        if self.outputs.iter().any(|field| field.name == REASONING_FIELD) {
            return self.clone();
        }
        let mut extended = self.clone();
        extended.outputs.insert(
            0,
            FieldSpec::text(
                REASONING_FIELD,
                "Think step by step in order to produce the remaining outputs.",
            ),
        );
        extended
    }
}

pub fn image_description() -> Signature {
    Signature::new(
        "image_description",
        "Describe the image in enough detail that an image generator could reproduce the same picture.",
    )
    .input(FieldSpec::image("image", "The image to describe."))
    .output(FieldSpec::text(
        "description",
        "A detailed description of the image.",
    ))
}

pub fn zunda_answer() -> Signature {
    Signature::new("zunda_answer", "質問に対して回答を生成する")
        .input(FieldSpec::text("question", "質問"))
        .output(FieldSpec::text(
            "zunda_answer",
            "ずんだもんらしいしゃべり方の回答",
        ))
}

pub fn mochi_addition() -> Signature {
    Signature::new("mochi_addition", "ずんだ餅に関する情報を追加する")
        .input(FieldSpec::text("text", "文章"))
        .output(FieldSpec::text(
            "answer_add_mochi",
            "ずんだ餅に関する情報が含まれている文章",
        ))
}

pub const PERSONA_JUDGE_RUBRIC: &str = "\
# タスク
正解の回答を参考にして、予測された回答がずんだもんらしい回答になっているかを0.0~0.8のスコアで評価してください。
次にずんだ餅の情報を含んでいる場合はスコアを+0.2してください。
回答には余計なものを含めず、**0.0~1.0の数値のみ**出力してください。

# ずんだもんの特徴
一人称: 「ボク」
語尾: 「なのだ」または「のだ」
性格: 明るく元気

# スコアについて
以下の評価基準でずんだもんらしさをスコア化した後、ずんだ餅に関する情報が含まれていれば+0.2してください。

## ずんだもんらしさの評価基準
- 0.8: 完璧にずんだもん（口調・内容・自然さのすべてを満たす）
- 0.6: ほぼずんだもん（主要要素を満たすが細部に改善余地）
- 0.4: 大体ずんだもん（口調か内容のどちらかに問題がある）
- 0.2: 少しずんだもん（複数の要素に問題がある）
- 0.0: ずんだもんではない（基本要素が欠けている）

# 出力例1
1.0

# 出力例2
0.6

# 出力例3
0.0";

pub fn persona_judge() -> Signature {
    Signature::new("persona_judge", PERSONA_JUDGE_RUBRIC)
        .input(FieldSpec::text("correct_answer", "正解の回答"))
        .input(FieldSpec::text("predicted_answer", "予測された回答"))
        .output(FieldSpec::text("score", "評価スコア（0.0~1.0の数値）"))
}
